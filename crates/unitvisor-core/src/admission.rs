use std::collections::HashMap;

/// Per-origin count of callers waiting on a unit that is still starting.
#[derive(Debug, Clone)]
pub struct RequestAdmissionQueue {
    max_size: usize,
    waiting: HashMap<String, usize>,
}

impl RequestAdmissionQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            waiting: HashMap::new(),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn get(&self, origin: &str) -> usize {
        self.waiting.get(origin).copied().unwrap_or(0)
    }

    /// True when another caller from `origin` may not join a pending start.
    pub fn is_full(&self, origin: &str) -> bool {
        self.get(origin) >= self.max_size
    }

    pub fn increment(&mut self, origin: &str) -> usize {
        let count = self.waiting.entry(origin.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn decrement(&mut self, origin: &str) -> usize {
        match self.waiting.get_mut(origin) {
            Some(count) if *count > 1 => {
                *count -= 1;
                *count
            }
            Some(_) => {
                self.waiting.remove(origin);
                0
            }
            None => 0,
        }
    }
}

impl Default for RequestAdmissionQueue {
    fn default() -> Self {
        Self::new(5)
    }
}
