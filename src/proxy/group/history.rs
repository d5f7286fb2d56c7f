//! 延迟采样存储
//!
//! 每个健康检查实例维护自己的滑动窗口（目的地、采样数各不相同），
//! 另有一份进程级的「最近一次结果」共享给管理面查询。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

/// 单次探测结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    /// 毫秒 RTT
    Rtt(u16),
    Failed,
}

impl Delay {
    pub fn is_failed(&self) -> bool {
        matches!(self, Delay::Failed)
    }

    /// 数值表示；失败记 0
    pub fn value(&self) -> u16 {
        match self {
            Delay::Rtt(ms) => *ms,
            Delay::Failed => 0,
        }
    }
}

/// 带时间戳的采样
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub at: Instant,
    pub delay: Delay,
}

/// 单个成员的有界采样窗口
#[derive(Debug)]
pub struct Samples {
    cap: usize,
    max_age: Duration,
    items: VecDeque<Sample>,
}

impl Samples {
    fn new(cap: usize, max_age: Duration) -> Self {
        Self {
            cap,
            max_age,
            items: VecDeque::with_capacity(cap),
        }
    }

    fn put(&mut self, delay: Delay) {
        let now = Instant::now();
        while let Some(front) = self.items.front() {
            if now.duration_since(front.at) > self.max_age {
                self.items.pop_front();
            } else {
                break;
            }
        }
        self.items.push_back(Sample { at: now, delay });
        while self.items.len() > self.cap {
            self.items.pop_front();
        }
    }

    fn latest(&self) -> Option<Sample> {
        self.items.back().copied()
    }

    /// 窗口内仍然新鲜的采样
    fn fresh(&self) -> impl Iterator<Item = &Sample> {
        let now = Instant::now();
        let max_age = self.max_age;
        self.items
            .iter()
            .filter(move |s| now.duration_since(s.at) <= max_age)
    }

    fn stats(&self) -> SampleStats {
        let mut rtts: Vec<u16> = Vec::new();
        let mut fail = 0usize;
        let mut total = 0usize;
        for sample in self.fresh() {
            total += 1;
            match sample.delay {
                Delay::Rtt(ms) => rtts.push(ms),
                Delay::Failed => fail += 1,
            }
        }
        rtts.sort_unstable();
        let median = if rtts.is_empty() {
            0
        } else {
            rtts[rtts.len() / 2]
        };
        SampleStats {
            total,
            fail,
            median,
            latest: self.latest().map(|s| s.delay),
        }
    }
}

/// 窗口统计，负载均衡的目标函数据此打分
#[derive(Debug, Clone, Copy, Default)]
pub struct SampleStats {
    /// 窗口内采样总数
    pub total: usize,
    /// 其中失败次数
    pub fail: usize,
    /// 成功采样的中位 RTT，无成功采样时为 0
    pub median: u16,
    pub latest: Option<Delay>,
}

/// 成员标签到采样窗口的映射
pub struct Storages {
    sampling: usize,
    max_age: Duration,
    inner: Mutex<HashMap<String, Samples>>,
}

impl Storages {
    pub fn new(sampling: usize, max_age: Duration) -> Self {
        Self {
            sampling,
            max_age,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn put(&self, tag: &str, delay: Delay) {
        let mut inner = self.inner.lock().expect("storage lock poisoned");
        inner
            .entry(tag.to_string())
            .or_insert_with(|| Samples::new(self.sampling, self.max_age))
            .put(delay);
    }

    pub fn latest(&self, tag: &str) -> Option<Sample> {
        let inner = self.inner.lock().expect("storage lock poisoned");
        inner.get(tag).and_then(|s| s.latest())
    }

    pub fn stats(&self, tag: &str) -> Option<SampleStats> {
        let inner = self.inner.lock().expect("storage lock poisoned");
        inner.get(tag).map(|s| s.stats())
    }

    pub fn list(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("storage lock poisoned");
        inner.keys().cloned().collect()
    }

    pub fn delete(&self, tag: &str) {
        let mut inner = self.inner.lock().expect("storage lock poisoned");
        inner.remove(tag);
    }
}

/// 管理面读取的进程级最近一次探测结果
#[derive(Debug, Clone, Copy)]
pub struct HistoryEntry {
    pub time: SystemTime,
    pub delay: Delay,
}

#[derive(Default)]
pub struct HistoryStorage {
    inner: Mutex<HashMap<String, HistoryEntry>>,
}

impl HistoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, tag: &str, delay: Delay) {
        let mut inner = self.inner.lock().expect("history lock poisoned");
        inner.insert(
            tag.to_string(),
            HistoryEntry {
                time: SystemTime::now(),
                delay,
            },
        );
    }

    pub fn latest(&self, tag: &str) -> Option<HistoryEntry> {
        let inner = self.inner.lock().expect("history lock poisoned");
        inner.get(tag).copied()
    }

    pub fn delete(&self, tag: &str) {
        let mut inner = self.inner.lock().expect("history lock poisoned");
        inner.remove(tag);
    }

    pub fn list(&self) -> Vec<(String, HistoryEntry)> {
        let inner = self.inner.lock().expect("history lock poisoned");
        inner.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_latest() {
        let storage = Storages::new(10, Duration::from_secs(60));
        storage.put("a", Delay::Rtt(42));
        let latest = storage.latest("a").unwrap();
        assert_eq!(latest.delay, Delay::Rtt(42));
    }

    #[test]
    fn window_evicts_oldest() {
        let storage = Storages::new(3, Duration::from_secs(60));
        storage.put("a", Delay::Rtt(1));
        for _ in 0..4 {
            storage.put("a", Delay::Failed);
        }
        // 首个成功采样早被挤出窗口
        let stats = storage.stats("a").unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.fail, 3);
        assert_eq!(storage.latest("a").unwrap().delay, Delay::Failed);
    }

    #[test]
    fn stats_median_and_fail_count() {
        let storage = Storages::new(10, Duration::from_secs(60));
        for rtt in [30u16, 10, 20] {
            storage.put("a", Delay::Rtt(rtt));
        }
        storage.put("a", Delay::Failed);
        let stats = storage.stats("a").unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.fail, 1);
        assert_eq!(stats.median, 20);
    }

    #[test]
    fn list_and_delete() {
        let storage = Storages::new(10, Duration::from_secs(60));
        storage.put("a", Delay::Rtt(1));
        storage.put("b", Delay::Rtt(2));
        let mut tags = storage.list();
        tags.sort();
        assert_eq!(tags, vec!["a", "b"]);

        storage.delete("a");
        assert!(storage.latest("a").is_none());
        assert!(storage.latest("b").is_some());
    }

    #[test]
    fn unknown_tag_is_none() {
        let storage = Storages::new(10, Duration::from_secs(60));
        assert!(storage.latest("nope").is_none());
        assert!(storage.stats("nope").is_none());
    }

    #[test]
    fn delay_value_and_failed() {
        assert_eq!(Delay::Rtt(7).value(), 7);
        assert_eq!(Delay::Failed.value(), 0);
        assert!(Delay::Failed.is_failed());
        assert!(!Delay::Rtt(7).is_failed());
    }

    #[test]
    fn history_storage_keeps_latest_only() {
        let history = HistoryStorage::new();
        history.store("a", Delay::Rtt(100));
        history.store("a", Delay::Rtt(50));
        assert_eq!(history.latest("a").unwrap().delay, Delay::Rtt(50));
        assert_eq!(history.list().len(), 1);

        history.delete("a");
        assert!(history.latest("a").is_none());
    }
}
