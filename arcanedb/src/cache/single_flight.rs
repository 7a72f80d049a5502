use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::CResult;

struct Call<V> {
    result: Mutex<Option<CResult<V>>>,
    cv: Condvar,
}

/// Deduplicates concurrent work by key: the first caller runs the closure,
/// everyone else arriving for the same key blocks and shares the result.
pub(crate) struct SingleFlight<V> {
    calls: Mutex<HashMap<String, Arc<Call<V>>>>,
}

impl<V: Clone> SingleFlight<V> {
    pub fn new() -> SingleFlight<V> {
        SingleFlight { calls: Mutex::new(HashMap::new()) }
    }

    pub fn work<F: FnOnce() -> CResult<V>>(&self, key: &str, func: F) -> CResult<V> {
        let (call, leader) = {
            let mut calls = self.calls.lock();
            match calls.get(key) {
                Some(call) => (call.clone(), false),
                None => {
                    let call =
                        Arc::new(Call { result: Mutex::new(None), cv: Condvar::new() });
                    calls.insert(key.to_owned(), call.clone());
                    (call, true)
                }
            }
        };

        if leader {
            let result = func();
            *call.result.lock() = Some(result.clone());
            call.cv.notify_all();
            self.calls.lock().remove(key);
            return result;
        }

        let mut result = call.result.lock();
        loop {
            if let Some(result) = result.as_ref() {
                return result.clone();
            }
            call.cv.wait(&mut result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn followers_share_the_leaders_result() {
        let flight = Arc::new(SingleFlight::<usize>::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let flight = flight.clone();
            let runs = runs.clone();
            handles.push(std::thread::spawn(move || {
                flight.work("page", || {
                    runs.fetch_add(1, Ordering::SeqCst);
                    // Give followers time to pile up on the same key.
                    std::thread::sleep(std::time::Duration::from_millis(20));
                    Ok(42)
                })
            }));
        }
        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), 42);
        }
        // At least one batch was deduplicated; with the sleep above, usually
        // all callers shared a single run, but a late arrival may start a
        // fresh one after the leader finished.
        assert!(runs.load(Ordering::SeqCst) < 8);
    }

    #[test]
    fn distinct_keys_run_independently() {
        let flight = SingleFlight::<String>::new();
        assert_eq!(flight.work("a", || Ok("a".to_owned())).unwrap(), "a");
        assert_eq!(flight.work("b", || Ok("b".to_owned())).unwrap(), "b");
    }
}
