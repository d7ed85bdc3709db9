use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    sync::Mutex,
};

use tokio::sync::Semaphore;

struct Inner<T> {
    // heap entries are (priority, insertion id); the payload lives in
    // `items` so deletion never has to touch the heap
    heap: BinaryHeap<Reverse<(u64, u64)>>,
    items: HashMap<u64, T>,
    counter: u64,
}

/// Min-priority queue supporting logical deletion of queued items.
///
/// Lower priority value wins; ties are FIFO via the insertion id.
/// `delete()` only removes payloads from the side table, leaving a
/// tombstoned heap entry that `get()` discards on pop. The semaphore holds
/// exactly one permit per heap entry (tombstoned or not), so a blocked
/// `get()` can never miss a wakeup.
pub struct MutablePriorityQueue<T> {
    inner: Mutex<Inner<T>>,
    avail: Semaphore,
}

impl<T> MutablePriorityQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                items: HashMap::new(),
                counter: 0,
            }),
            avail: Semaphore::new(0),
        }
    }

    pub fn put(&self, priority: u64, item: T) {
        {
            let mut inner = self.inner.lock().unwrap();
            let iid = inner.counter;
            inner.counter += 1;
            inner.items.insert(iid, item);
            inner.heap.push(Reverse((priority, iid)));
        }
        self.avail.add_permits(1);
    }

    /// Waits until a live item is available and returns the one with the
    /// smallest priority.
    pub async fn get(&self) -> T {
        loop {
            let permit = self.avail.acquire().await.expect("queue semaphore closed");
            permit.forget();
            let popped = {
                let mut inner = self.inner.lock().unwrap();
                let Reverse((_, iid)) = inner.heap.pop().expect("heap empty with permit held");
                inner.items.remove(&iid)
            };
            if let Some(item) = popped {
                return item;
            }
            // tombstone, permit and heap entry consumed together; try again
        }
    }

    /// Logically removes every queued item matching `pred`, returning how
    /// many were dropped.
    pub fn delete(&self, pred: impl Fn(&T) -> bool) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.items.len();
        inner.items.retain(|_, item| !pred(item));
        before - inner.items.len()
    }

    /// Number of live (non-tombstoned) items.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for MutablePriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};

    #[tokio::test]
    async fn test_priority_order() {
        let q = MutablePriorityQueue::new();
        q.put(30, "c");
        q.put(10, "a");
        q.put(20, "b");
        assert_eq!(q.get().await, "a");
        assert_eq!(q.get().await, "b");
        assert_eq!(q.get().await, "c");
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let q = MutablePriorityQueue::new();
        for i in 0..10 {
            q.put(5, i);
        }
        for i in 0..10 {
            assert_eq!(q.get().await, i);
        }
    }

    #[tokio::test]
    async fn test_delete_tombstones() {
        let q = MutablePriorityQueue::new();
        q.put(1, ("x", 1));
        q.put(2, ("y", 2));
        q.put(3, ("x", 3));
        assert_eq!(q.delete(|(tag, _)| *tag == "x"), 2);
        assert_eq!(q.len(), 1);
        // tombstoned entries are skipped, not returned
        assert_eq!(q.get().await, ("y", 2));
    }

    #[tokio::test]
    async fn test_delete_all_then_put_wakes_getter() {
        let q = Arc::new(MutablePriorityQueue::new());
        q.put(1, 1u32);
        q.put(1, 2u32);
        assert_eq!(q.delete(|_| true), 2);

        let q2 = q.clone();
        let getter = tokio::spawn(async move { q2.get().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!getter.is_finished());

        q.put(1, 3u32);
        assert_eq!(getter.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_get_blocks_until_put() {
        let q = Arc::new(MutablePriorityQueue::new());
        let q2 = q.clone();
        let getter = tokio::spawn(async move { q2.get().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!getter.is_finished());
        q.put(7, "hello");
        assert_eq!(getter.await.unwrap(), "hello");
    }
}
