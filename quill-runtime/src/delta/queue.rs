use std::collections::VecDeque;

/// FIFO that can be paused without losing items.
///
/// While paused, pushes still buffer but [`pop`](Self::pop) yields nothing.
#[derive(Debug)]
pub struct DeltaQueue<T> {
    queue: VecDeque<T>,
    paused: bool,
}

impl<T> DeltaQueue<T> {
    pub fn new(paused: bool) -> Self {
        Self {
            queue: VecDeque::new(),
            paused,
        }
    }

    pub fn push(&mut self, item: T) {
        self.queue.push_back(item);
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.paused {
            return None;
        }
        self.queue.pop_front()
    }

    /// Take everything buffered, ignoring the pause flag.
    pub fn drain_all(&mut self) -> Vec<T> {
        self.queue.drain(..).collect()
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paused_queue_buffers() {
        let mut queue = DeltaQueue::new(true);
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.pop(), None);
        assert_eq!(queue.len(), 2);

        queue.resume();
        assert_eq!(queue.pop(), Some(1));
        queue.pause();
        assert_eq!(queue.pop(), None);
        assert_eq!(queue.drain_all(), vec![2]);
        assert!(queue.is_empty());
    }
}
