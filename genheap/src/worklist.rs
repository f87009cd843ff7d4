use crossbeam_deque::{Injector, Steal};

use crate::value::Value;

/// The shared half of the mark worklist. Write and read barriers on the
/// mutator push here while the marker thread owns a private `Worker` deque
/// and pulls from this queue between chunks of tracing.
pub(crate) struct MarkWorklist {
    global: Injector<Value>,
}

impl MarkWorklist {
    pub fn new() -> MarkWorklist {
        MarkWorklist {
            global: Injector::new(),
        }
    }

    pub fn enqueue(&self, value: Value) {
        self.global.push(value);
    }

    pub fn is_empty(&self) -> bool {
        self.global.is_empty()
    }

    /// Hand every queued value to `f`
    pub fn drain<F>(&self, mut f: F)
    where
        F: FnMut(Value),
    {
        loop {
            match self.global.steal() {
                Steal::Success(value) => f(value),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_drains_everything_pushed_from_other_threads() {
        let worklist = Arc::new(MarkWorklist::new());
        let pushers: Vec<_> = (0..4)
            .map(|t| {
                let worklist = Arc::clone(&worklist);
                thread::spawn(move || {
                    for i in 0..100 {
                        worklist.enqueue(Value::Int(t * 1000 + i));
                    }
                })
            })
            .collect();
        for pusher in pushers {
            pusher.join().unwrap();
        }

        let mut seen = Vec::new();
        worklist.drain(|v| seen.push(v));
        assert_eq!(seen.len(), 400);
        assert!(worklist.is_empty());
    }
}
