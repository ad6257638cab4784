// src/data/frequency_cap.rs
//
// 频控事件账本：有界存储，双阈值（绝对上限 / 较低目标值）滞回淘汰，
// 全局与按买方两套上限相互独立。

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::model::adtech::AdTechIdentifier;
use crate::model::custom_audience::{AdEventType, HistogramEvent};

/// 直方图容量上限对
///
/// 超过 absolute 才触发淘汰，一次淘汰到 lower 为止，避免贴着上限时
/// 每次插入都要淘汰。
#[derive(Debug, Clone)]
pub struct HistogramLimits {
    pub absolute_max_total_event_count: usize,
    pub lower_max_total_event_count: usize,
    pub absolute_max_per_buyer_event_count: usize,
    pub lower_max_per_buyer_event_count: usize,
}

impl Default for HistogramLimits {
    fn default() -> Self {
        Self {
            absolute_max_total_event_count: 10_000,
            lower_max_total_event_count: 9_500,
            absolute_max_per_buyer_event_count: 1_000,
            lower_max_per_buyer_event_count: 950,
        }
    }
}

impl HistogramLimits {
    fn validate(&self) {
        assert!(self.absolute_max_total_event_count > 0);
        assert!(self.lower_max_total_event_count > 0);
        assert!(self.absolute_max_per_buyer_event_count > 0);
        assert!(self.lower_max_per_buyer_event_count > 0);
        assert!(self.lower_max_total_event_count <= self.absolute_max_total_event_count);
        assert!(self.lower_max_per_buyer_event_count <= self.absolute_max_per_buyer_event_count);
    }
}

#[derive(Default)]
struct HistogramInner {
    // 按插入顺序保存，front 最旧
    events: VecDeque<HistogramEvent>,
    per_buyer_counts: HashMap<AdTechIdentifier, usize>,
}

impl HistogramInner {
    fn remove_oldest_for_buyer(&mut self, buyer: &AdTechIdentifier) {
        if let Some(pos) = self.events.iter().position(|e| &e.buyer == buyer) {
            self.events.remove(pos);
            if let Some(count) = self.per_buyer_counts.get_mut(buyer) {
                *count -= 1;
            }
        }
    }

    fn remove_oldest(&mut self) {
        if let Some(event) = self.events.pop_front() {
            if let Some(count) = self.per_buyer_counts.get_mut(&event.buyer) {
                *count -= 1;
            }
        }
    }
}

/// 频控直方图存储
///
/// 插入与淘汰在同一把锁内完成，保证并发插入下界限不被突破。
pub struct HistogramStore {
    limits: HistogramLimits,
    inner: Mutex<HistogramInner>,
}

impl HistogramStore {
    pub fn new(limits: HistogramLimits) -> Self {
        limits.validate();
        Self {
            limits,
            inner: Mutex::new(HistogramInner::default()),
        }
    }

    /// 插入一条事件；超出绝对上限时向下淘汰到较低目标值
    pub fn insert_event(&self, event: HistogramEvent) {
        let mut inner = self.inner.lock();
        let buyer = event.buyer.clone();
        inner.events.push_back(event);
        *inner.per_buyer_counts.entry(buyer.clone()).or_insert(0) += 1;

        if inner.per_buyer_counts[&buyer] > self.limits.absolute_max_per_buyer_event_count {
            while inner.per_buyer_counts[&buyer] > self.limits.lower_max_per_buyer_event_count {
                inner.remove_oldest_for_buyer(&buyer);
            }
        }
        if inner.events.len() > self.limits.absolute_max_total_event_count {
            while inner.events.len() > self.limits.lower_max_total_event_count {
                inner.remove_oldest();
            }
        }
    }

    /// 统计某 (key, buyer, type) 在 after 之后的事件数 —— 频控过滤的依据
    pub fn count_events_after(
        &self,
        ad_counter_key: i32,
        buyer: &AdTechIdentifier,
        event_type: AdEventType,
        after: DateTime<Utc>,
    ) -> usize {
        let inner = self.inner.lock();
        inner
            .events
            .iter()
            .filter(|e| {
                e.ad_counter_key == ad_counter_key
                    && &e.buyer == buyer
                    && e.event_type == event_type
                    && e.timestamp > after
            })
            .count()
    }

    pub fn total_event_count(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn event_count_for_buyer(&self, buyer: &AdTechIdentifier) -> usize {
        self.inner
            .lock()
            .per_buyer_counts
            .get(buyer)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn event(buyer: &str, key: i32, event_type: AdEventType, at: DateTime<Utc>) -> HistogramEvent {
        HistogramEvent {
            buyer: AdTechIdentifier::new(buyer),
            ad_counter_key: key,
            event_type,
            timestamp: at,
        }
    }

    fn small_store() -> HistogramStore {
        HistogramStore::new(HistogramLimits {
            absolute_max_total_event_count: 20,
            lower_max_total_event_count: 15,
            absolute_max_per_buyer_event_count: 10,
            lower_max_per_buyer_event_count: 5,
        })
    }

    #[test]
    fn per_buyer_eviction_settles_at_lower_target() {
        let store = small_store();
        let now = Utc::now();
        // 11 条超过绝对上限 10，触发后收敛到 5
        for i in 0..11 {
            store.insert_event(event("buyer.com", 1, AdEventType::Click, now + Duration::seconds(i)));
        }
        assert_eq!(
            store.event_count_for_buyer(&AdTechIdentifier::new("buyer.com")),
            5
        );
    }

    #[test]
    fn global_eviction_settles_at_lower_target_and_drops_oldest() {
        let store = small_store();
        let now = Utc::now();
        // 每个买方最多插 7 条，避开按买方上限，专测全局上限 20 → 15
        for i in 0..7 {
            store.insert_event(event("a.com", 1, AdEventType::Click, now + Duration::seconds(i)));
        }
        for i in 0..7 {
            store.insert_event(event("b.com", 1, AdEventType::Click, now + Duration::seconds(7 + i)));
        }
        for i in 0..7 {
            store.insert_event(event("c.com", 1, AdEventType::Click, now + Duration::seconds(14 + i)));
        }
        assert_eq!(store.total_event_count(), 15);
        // 最旧的 a.com 被先淘汰
        assert!(store.event_count_for_buyer(&AdTechIdentifier::new("a.com")) < 7);
        assert_eq!(store.event_count_for_buyer(&AdTechIdentifier::new("c.com")), 7);
    }

    #[test]
    fn count_filters_by_key_buyer_type_and_time() {
        let store = small_store();
        let now = Utc::now();
        let buyer = AdTechIdentifier::new("buyer.com");
        store.insert_event(event("buyer.com", 1, AdEventType::Click, now));
        store.insert_event(event("buyer.com", 1, AdEventType::View, now));
        store.insert_event(event("buyer.com", 2, AdEventType::Click, now));
        store.insert_event(event("other.com", 1, AdEventType::Click, now));
        store.insert_event(event("buyer.com", 1, AdEventType::Click, now - Duration::days(2)));

        let one_day_ago = now - Duration::days(1);
        assert_eq!(
            store.count_events_after(1, &buyer, AdEventType::Click, one_day_ago),
            1
        );
        // 窗口推到两天前，旧事件也计入
        assert_eq!(
            store.count_events_after(1, &buyer, AdEventType::Click, now - Duration::days(3)),
            2
        );
    }
}
