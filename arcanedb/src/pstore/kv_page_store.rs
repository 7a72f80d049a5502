use parking_lot::Mutex;

use crate::error::{CResult, Error};
use crate::pstore::{PageStore, RawPage, RawPageType};
use crate::storage::engine::Engine;

// Suffixes distinguishing the blobs of one page id. The 0x00 separator keeps
// the keys of one page clustered under a common prefix no other page id can
// produce, since page ids never contain NUL.
const KEY_SEPARATOR: u8 = 0x00;
const BASE_TAG: u8 = b'B';
const DELTA_TAG: u8 = b'D';

/// A [`PageStore`] persisting base and delta blobs as suffixed keys of a
/// [`Engine`]: `<page id> 0x00 'B'` for the base and
/// `<page id> 0x00 'D' <seq u32 be>` for deltas, so a prefix scan yields the
/// base followed by the deltas oldest first.
pub struct KvPageStore<E: Engine> {
    engine: Mutex<E>,
}

impl<E: Engine> KvPageStore<E> {
    pub fn new(engine: E) -> KvPageStore<E> {
        KvPageStore { engine: Mutex::new(engine) }
    }

    fn prefix(page_id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(page_id.len() + 1);
        key.extend_from_slice(page_id.as_bytes());
        key.push(KEY_SEPARATOR);
        key
    }

    fn base_key(page_id: &str) -> Vec<u8> {
        let mut key = Self::prefix(page_id);
        key.push(BASE_TAG);
        key
    }

    fn delta_key(page_id: &str, seq: u32) -> Vec<u8> {
        let mut key = Self::prefix(page_id);
        key.push(DELTA_TAG);
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    fn classify(prefix_len: usize, key: &[u8]) -> CResult<(RawPageType, u32)> {
        match key.get(prefix_len) {
            Some(&BASE_TAG) => Ok((RawPageType::Base, 0)),
            Some(&DELTA_TAG) => {
                let seq = key
                    .get(prefix_len + 1..prefix_len + 5)
                    .ok_or_else(|| Error::Corrupted("truncated delta key".to_owned()))?;
                Ok((RawPageType::Delta, u32::from_be_bytes([seq[0], seq[1], seq[2], seq[3]])))
            }
            _ => Err(Error::Corrupted(format!("unrecognized page store key {:02x?}", key))),
        }
    }
}

impl<E: Engine> PageStore for KvPageStore<E> {
    fn read_page(&self, page_id: &str) -> CResult<Vec<RawPage>> {
        let prefix = Self::prefix(page_id);
        let mut engine = self.engine.lock();
        let mut base: Option<RawPage> = None;
        let mut deltas: Vec<(u32, RawPage)> = Vec::new();
        for item in engine.scan_prefix(&prefix) {
            let (key, value) = item?;
            let (page_type, seq) = Self::classify(prefix.len(), &key)?;
            match page_type {
                RawPageType::Base => base = Some(RawPage { page_type, data: value }),
                RawPageType::Delta => deltas.push((seq, RawPage { page_type, data: value })),
            }
        }
        if base.is_none() && deltas.is_empty() {
            return Err(Error::NotFound);
        }
        // Head-first: newest delta down to the base.
        deltas.sort_by(|a, b| b.0.cmp(&a.0));
        let mut pages: Vec<RawPage> = deltas.into_iter().map(|(_, page)| page).collect();
        if let Some(base) = base {
            pages.push(base);
        }
        Ok(pages)
    }

    fn update_replacement(&self, page_id: &str, data: &[u8]) -> CResult<()> {
        let prefix = Self::prefix(page_id);
        let mut engine = self.engine.lock();
        let delta_keys: Vec<Vec<u8>> = engine
            .scan_prefix(&prefix)
            .map(|item| item.map(|(key, _)| key))
            .collect::<CResult<Vec<_>>>()?
            .into_iter()
            .filter(|key| key.get(prefix.len()) == Some(&DELTA_TAG))
            .collect();
        engine.set(&Self::base_key(page_id), data.to_vec())?;
        for key in delta_keys {
            engine.delete(&key)?;
        }
        Ok(())
    }

    fn update_delta(&self, page_id: &str, data: &[u8]) -> CResult<()> {
        let prefix = Self::prefix(page_id);
        let mut engine = self.engine.lock();
        let mut next_seq = 0u32;
        for item in engine.scan_prefix(&prefix) {
            let (key, _) = item?;
            if let (RawPageType::Delta, seq) = Self::classify(prefix.len(), &key)? {
                next_seq = next_seq.max(seq + 1);
            }
        }
        engine.set(&Self::delta_key(page_id, next_seq), data.to_vec())
    }

    fn delete_page(&self, page_id: &str) -> CResult<()> {
        let prefix = Self::prefix(page_id);
        let mut engine = self.engine.lock();
        let keys: Vec<Vec<u8>> = engine
            .scan_prefix(&prefix)
            .map(|item| item.map(|(key, _)| key))
            .collect::<CResult<Vec<_>>>()?;
        for key in keys {
            engine.delete(&key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::Memory;

    fn store() -> KvPageStore<Memory> {
        KvPageStore::new(Memory::new())
    }

    #[test]
    fn missing_page_is_not_found() {
        assert_eq!(store().read_page("1E").err(), Some(Error::NotFound));
    }

    #[test]
    fn base_then_deltas_come_back_head_first() -> CResult<()> {
        let store = store();
        store.update_replacement("1E", b"base")?;
        store.update_delta("1E", b"d0")?;
        store.update_delta("1E", b"d1")?;

        let pages = store.read_page("1E")?;
        assert_eq!(
            pages,
            vec![
                RawPage { page_type: RawPageType::Delta, data: b"d1".to_vec() },
                RawPage { page_type: RawPageType::Delta, data: b"d0".to_vec() },
                RawPage { page_type: RawPageType::Base, data: b"base".to_vec() },
            ]
        );
        Ok(())
    }

    #[test]
    fn replacement_discards_deltas() -> CResult<()> {
        let store = store();
        store.update_replacement("1E", b"v1")?;
        store.update_delta("1E", b"d0")?;
        store.update_replacement("1E", b"v2")?;

        let pages = store.read_page("1E")?;
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].data, b"v2".to_vec());
        Ok(())
    }

    #[test]
    fn pages_do_not_interfere() -> CResult<()> {
        let store = store();
        store.update_replacement("1E", b"one")?;
        store.update_replacement("1Ex", b"other")?;
        store.delete_page("1E")?;

        assert_eq!(store.read_page("1E").err(), Some(Error::NotFound));
        assert_eq!(store.read_page("1Ex")?.len(), 1);
        Ok(())
    }
}
