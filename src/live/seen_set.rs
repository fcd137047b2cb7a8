//! 已投递集合
//!
//! 每个会话一份，有容量上限，超过时按插入顺序淘汰最旧的 ID。

use std::collections::{HashSet, VecDeque};

/// 已投递的本地 ID 集合
#[derive(Debug, Clone)]
pub struct SeenSet {
    order: VecDeque<i64>,
    ids: HashSet<i64>,
    capacity: usize,
}

impl SeenSet {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity.min(1024)),
            ids: HashSet::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn contains(&self, id: i64) -> bool {
        self.ids.contains(&id)
    }

    /// 插入；已存在返回 false
    pub fn insert(&mut self, id: i64) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        true
    }

    /// 裁剪到容量上限，返回淘汰数量
    pub fn trim(&mut self) -> usize {
        let mut evicted = 0;
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
                evicted += 1;
            }
        }
        evicted
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }
}
