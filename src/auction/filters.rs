// src/auction/filters.rs
//
// 广告级过滤，固定顺序：先频控，再应用安装。某个阶段的开关关闭时
// 整个阶段被跳过（不是"全部通过"，是根本不执行）。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::data::app_install::AppInstallStore;
use crate::data::frequency_cap::HistogramStore;
use crate::model::adtech::AdTechIdentifier;
use crate::model::custom_audience::{
    AdData, AdEventType, CustomAudience, KeyedFrequencyCap,
};

/// 出站候选的广告过滤器
pub struct AdFilterer {
    frequency_cap_enabled: bool,
    app_install_enabled: bool,
    histogram: Arc<HistogramStore>,
    app_install: Arc<AppInstallStore>,
}

impl AdFilterer {
    pub fn new(
        frequency_cap_enabled: bool,
        app_install_enabled: bool,
        histogram: Arc<HistogramStore>,
        app_install: Arc<AppInstallStore>,
    ) -> Self {
        Self {
            frequency_cap_enabled,
            app_install_enabled,
            histogram,
            app_install,
        }
    }

    /// 过滤每个受众的广告列表；一个广告都不剩的受众整体剔除
    pub fn filter_custom_audiences(
        &self,
        audiences: Vec<CustomAudience>,
        now: DateTime<Utc>,
    ) -> Vec<CustomAudience> {
        audiences
            .into_iter()
            .filter_map(|mut audience| {
                let before = audience.ads.len();
                let buyer = audience.buyer.clone();
                audience
                    .ads
                    .retain(|ad| self.ad_passes(ad, &buyer, now));
                if audience.ads.len() < before {
                    debug!(
                        buyer = %audience.buyer,
                        name = %audience.name,
                        dropped = before - audience.ads.len(),
                        "ad filters dropped ads from custom audience"
                    );
                }
                if audience.ads.is_empty() {
                    None
                } else {
                    Some(audience)
                }
            })
            .collect()
    }

    fn ad_passes(&self, ad: &AdData, buyer: &AdTechIdentifier, now: DateTime<Utc>) -> bool {
        let Some(filters) = &ad.filters else {
            return true;
        };

        if self.frequency_cap_enabled {
            if let Some(caps) = &filters.frequency_cap_filters {
                let groups: [(&[KeyedFrequencyCap], AdEventType); 4] = [
                    (caps.for_win_events.as_slice(), AdEventType::Win),
                    (caps.for_impression_events.as_slice(), AdEventType::Impression),
                    (caps.for_view_events.as_slice(), AdEventType::View),
                    (caps.for_click_events.as_slice(), AdEventType::Click),
                ];
                for (caps, event_type) in groups {
                    for cap in caps {
                        let window_start = now - cap.interval();
                        let count = self.histogram.count_events_after(
                            cap.ad_counter_key,
                            buyer,
                            event_type,
                            window_start,
                        );
                        if count >= cap.max_count {
                            return false;
                        }
                    }
                }
            }
        }

        if self.app_install_enabled {
            if let Some(app_filters) = &filters.app_install_filters {
                for package in &app_filters.package_names {
                    if !self.app_install.can_buyer_filter(buyer, package) {
                        return false;
                    }
                }
            }
        }

        true
    }
}
