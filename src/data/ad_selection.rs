// src/data/ad_selection.rs
//
// 会话 / 胜出 / 报告 / 交互信标四张逻辑表。胜出结果的写入是一次
// 原子提交：同一把锁内完成全部行写入，超时被放弃的请求不会留下
// 只写了一半的状态。

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{ExchangeError, ExchangeResult};
use crate::model::auction::{
    AuctionSession, RegisteredAdInteraction, ReportingData, ReportingDestination, WinnerRecord,
};

/// 交互信标的数量上限（字节上限在落库前的校验环节处理）
#[derive(Debug, Clone, Copy)]
pub struct BeaconCountLimits {
    pub max_total_count: usize,
    pub max_per_destination_count: usize,
}

impl Default for BeaconCountLimits {
    fn default() -> Self {
        Self {
            max_total_count: 10,
            max_per_destination_count: 10,
        }
    }
}

/// 一次胜出落库的全部内容
#[derive(Debug, Clone)]
pub struct AuctionOutcome {
    pub winner: WinnerRecord,
    pub reporting: ReportingData,
    pub interactions: Vec<RegisteredAdInteraction>,
    pub beacon_limits: BeaconCountLimits,
}

/// 竞价数据仓库接口
pub trait AdSelectionStore: Send + Sync {
    /// 登记会话；同一 id 重复登记是错误
    fn persist_session(&self, ad_selection_id: u64, session: AuctionSession) -> ExchangeResult<()>;

    fn session(&self, ad_selection_id: u64) -> Option<AuctionSession>;

    /// 原子落库一次胜出结果；超过数量上限的信标逐条拒绝而不是整体失败
    fn persist_auction_outcome(
        &self,
        ad_selection_id: u64,
        outcome: AuctionOutcome,
    ) -> ExchangeResult<()>;

    fn winner(&self, ad_selection_id: u64) -> Option<WinnerRecord>;

    fn reporting_data(&self, ad_selection_id: u64) -> Option<ReportingData>;

    fn interactions(&self, ad_selection_id: u64) -> Vec<RegisteredAdInteraction>;

    fn total_interaction_count(&self) -> usize;
}

#[derive(Default)]
struct AdSelectionTables {
    sessions: HashMap<u64, AuctionSession>,
    winners: HashMap<u64, WinnerRecord>,
    reporting: HashMap<u64, ReportingData>,
    interactions: HashMap<u64, Vec<RegisteredAdInteraction>>,
}

/// 内存实现
#[derive(Default)]
pub struct InMemoryAdSelectionStore {
    tables: Mutex<AdSelectionTables>,
}

impl InMemoryAdSelectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AdSelectionStore for InMemoryAdSelectionStore {
    fn persist_session(&self, ad_selection_id: u64, session: AuctionSession) -> ExchangeResult<()> {
        let mut tables = self.tables.lock();
        if tables.sessions.contains_key(&ad_selection_id) {
            return Err(ExchangeError::internal(format!(
                "ad selection id {ad_selection_id} already initialized"
            )));
        }
        tables.sessions.insert(ad_selection_id, session);
        Ok(())
    }

    fn session(&self, ad_selection_id: u64) -> Option<AuctionSession> {
        self.tables.lock().sessions.get(&ad_selection_id).cloned()
    }

    fn persist_auction_outcome(
        &self,
        ad_selection_id: u64,
        outcome: AuctionOutcome,
    ) -> ExchangeResult<()> {
        let mut tables = self.tables.lock();
        if !tables.sessions.contains_key(&ad_selection_id) {
            return Err(ExchangeError::invalid_argument(format!(
                "no session initialized for ad selection id {ad_selection_id}"
            )));
        }

        tables.winners.insert(ad_selection_id, outcome.winner);
        tables.reporting.insert(ad_selection_id, outcome.reporting);

        let mut total: usize = tables.interactions.values().map(Vec::len).sum();
        let mut per_destination: HashMap<ReportingDestination, usize> = HashMap::new();
        for beacon in tables
            .interactions
            .get(&ad_selection_id)
            .into_iter()
            .flatten()
        {
            *per_destination.entry(beacon.destination).or_insert(0) += 1;
        }

        for beacon in outcome.interactions {
            if total >= outcome.beacon_limits.max_total_count {
                warn!(
                    interaction_key = %beacon.interaction_key,
                    "dropping ad interaction: registered beacon table is full"
                );
                continue;
            }
            let destination_count = per_destination.entry(beacon.destination).or_insert(0);
            if *destination_count >= outcome.beacon_limits.max_per_destination_count {
                warn!(
                    interaction_key = %beacon.interaction_key,
                    "dropping ad interaction: per-destination beacon limit reached"
                );
                continue;
            }
            *destination_count += 1;
            total += 1;
            tables
                .interactions
                .entry(ad_selection_id)
                .or_default()
                .push(beacon);
        }
        Ok(())
    }

    fn winner(&self, ad_selection_id: u64) -> Option<WinnerRecord> {
        self.tables.lock().winners.get(&ad_selection_id).cloned()
    }

    fn reporting_data(&self, ad_selection_id: u64) -> Option<ReportingData> {
        self.tables.lock().reporting.get(&ad_selection_id).cloned()
    }

    fn interactions(&self, ad_selection_id: u64) -> Vec<RegisteredAdInteraction> {
        self.tables
            .lock()
            .interactions
            .get(&ad_selection_id)
            .cloned()
            .unwrap_or_default()
    }

    fn total_interaction_count(&self) -> usize {
        self.tables.lock().interactions.values().map(Vec::len).sum()
    }
}
