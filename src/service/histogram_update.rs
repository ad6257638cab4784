// src/service/histogram_update.rs
//
// 非胜出事件（曝光/可见/点击）的频控直方图更新。胜出事件只能由
// 落库协调器写入，这里一律拒绝，防止调用方伪造。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::data::ad_selection::AdSelectionStore;
use crate::data::frequency_cap::HistogramStore;
use crate::error::{ExchangeError, ExchangeResult};
use crate::model::custom_audience::{AdEventType, HistogramEvent};

#[derive(Debug, Clone)]
pub struct UpdateAdCounterHistogramRequest {
    pub ad_selection_id: u64,
    pub event_type: AdEventType,
    pub caller_package_name: String,
}

pub struct AdCounterHistogramUpdater {
    ad_selection_store: Arc<dyn AdSelectionStore>,
    histogram: Arc<HistogramStore>,
}

impl AdCounterHistogramUpdater {
    pub fn new(
        ad_selection_store: Arc<dyn AdSelectionStore>,
        histogram: Arc<HistogramStore>,
    ) -> Self {
        Self {
            ad_selection_store,
            histogram,
        }
    }

    pub fn update(
        &self,
        request: &UpdateAdCounterHistogramRequest,
        now: DateTime<Utc>,
    ) -> ExchangeResult<()> {
        if request.event_type == AdEventType::Win {
            return Err(ExchangeError::invalid_argument(
                "win events cannot be registered from outside the persistence path",
            ));
        }

        let session = self
            .ad_selection_store
            .session(request.ad_selection_id)
            .ok_or_else(|| {
                ExchangeError::invalid_argument(format!(
                    "no session found for ad selection id {}",
                    request.ad_selection_id
                ))
            })?;
        if session.caller_package_name != request.caller_package_name {
            return Err(ExchangeError::invalid_argument(format!(
                "caller {} does not own ad selection id {}",
                request.caller_package_name, request.ad_selection_id
            )));
        }

        let winner = self
            .ad_selection_store
            .winner(request.ad_selection_id)
            .ok_or_else(|| {
                ExchangeError::invalid_argument(format!(
                    "no winner recorded for ad selection id {}",
                    request.ad_selection_id
                ))
            })?;

        info!(
            "Recording {:?} histogram events for {} counter keys",
            request.event_type,
            winner.ad_counter_keys.len()
        );
        for ad_counter_key in &winner.ad_counter_keys {
            self.histogram.insert_event(HistogramEvent {
                buyer: winner.buyer.clone(),
                ad_counter_key: *ad_counter_key,
                event_type: request.event_type,
                timestamp: now,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ad_selection::{
        AuctionOutcome, BeaconCountLimits, InMemoryAdSelectionStore,
    };
    use crate::data::frequency_cap::HistogramLimits;
    use crate::model::adtech::AdTechIdentifier;
    use crate::model::auction::{AuctionSession, ReportingData, WinnerRecord};
    use std::collections::BTreeSet;

    const ID: u64 = 77;

    fn setup(with_winner: bool) -> (AdCounterHistogramUpdater, Arc<HistogramStore>) {
        let store = Arc::new(InMemoryAdSelectionStore::new());
        store
            .persist_session(
                ID,
                AuctionSession {
                    seller: AdTechIdentifier::new("seller.com"),
                    caller_package_name: "com.example.app".into(),
                    creation_time: Utc::now(),
                },
            )
            .unwrap();
        if with_winner {
            store
                .persist_auction_outcome(
                    ID,
                    AuctionOutcome {
                        winner: WinnerRecord {
                            bid: 1.0,
                            ad_render_uri: "https://buyer.com/render".into(),
                            buyer: AdTechIdentifier::new("buyer.com"),
                            custom_audience_owner: "owner".into(),
                            custom_audience_name: "shoes".into(),
                            ad_counter_keys: BTreeSet::from([1, 2]),
                        },
                        reporting: ReportingData::default(),
                        interactions: vec![],
                        beacon_limits: BeaconCountLimits::default(),
                    },
                )
                .unwrap();
        }
        let histogram = Arc::new(HistogramStore::new(HistogramLimits::default()));
        (
            AdCounterHistogramUpdater::new(store, histogram.clone()),
            histogram,
        )
    }

    fn request(event_type: AdEventType, caller: &str) -> UpdateAdCounterHistogramRequest {
        UpdateAdCounterHistogramRequest {
            ad_selection_id: ID,
            event_type,
            caller_package_name: caller.into(),
        }
    }

    #[test]
    fn click_event_is_recorded_for_every_counter_key() {
        let (updater, histogram) = setup(true);
        let now = Utc::now();
        updater
            .update(&request(AdEventType::Click, "com.example.app"), now)
            .unwrap();

        let buyer = AdTechIdentifier::new("buyer.com");
        let window = now - chrono::Duration::days(1);
        assert_eq!(histogram.count_events_after(1, &buyer, AdEventType::Click, window), 1);
        assert_eq!(histogram.count_events_after(2, &buyer, AdEventType::Click, window), 1);
    }

    #[test]
    fn win_events_are_rejected() {
        let (updater, histogram) = setup(true);
        assert!(updater
            .update(&request(AdEventType::Win, "com.example.app"), Utc::now())
            .is_err());
        assert_eq!(histogram.total_event_count(), 0);
    }

    #[test]
    fn foreign_caller_is_rejected() {
        let (updater, _) = setup(true);
        assert!(updater
            .update(&request(AdEventType::Click, "com.other.app"), Utc::now())
            .is_err());
    }

    #[test]
    fn missing_winner_is_an_invalid_argument() {
        let (updater, _) = setup(false);
        assert!(updater
            .update(&request(AdEventType::Click, "com.example.app"), Utc::now())
            .is_err());
    }
}
