use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

/// 只记住最近插入的 `capacity` 个元素，超出后按插入顺序淘汰最旧的
#[derive(Debug)]
pub struct RecentSet<T> {
    capacity: usize,
    order: VecDeque<T>,
    members: HashSet<T>,
}

impl<T: Eq + Hash + Clone> RecentSet<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            members: HashSet::new(),
        }
    }

    /// 插入元素，返回被淘汰的元素
    pub fn insert(&mut self, value: T) -> Option<T> {
        if !self.members.insert(value.clone()) {
            return None;
        }
        self.order.push_back(value);
        if self.order.len() <= self.capacity {
            return None;
        }
        let evicted = self.order.pop_front()?;
        self.members.remove(&evicted);
        Some(evicted)
    }

    pub fn contains(&self, value: &T) -> bool {
        self.members.contains(value)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
