//! Cost ledger
//!
//! Per-call accumulator for carrier, STT, TTS and LLM charges. Carrier
//! call and streaming minutes are rounded up and counted from the moment
//! the call connected; the transfer fee is flat, charged once. The
//! in-memory entry is retained after finalize for fast reads.

use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;

use outdial_config::CostRates;
use outdial_llm::TokenUsage;

/// Chargeable service categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CostService {
    CarrierCall,
    CarrierStream,
    CarrierTransfer,
    Stt,
    Tts,
    Llm,
}

/// Append-only log line per chargeable event
#[derive(Debug, Clone, Serialize)]
pub struct CostEntry {
    pub service: CostService,
    pub quantity: f64,
    pub unit: &'static str,
    pub cost: f64,
}

#[derive(Debug, Default)]
struct CallCosts {
    initiated: Option<Instant>,
    connected: Option<Instant>,
    streaming_started: Option<Instant>,
    ended: Option<Instant>,
    stt_seconds: f64,
    tts_seconds: f64,
    prompt_tokens: u64,
    completion_tokens: u64,
    llm_calls: u64,
    transfers: u32,
}

/// Finalized totals for one call
#[derive(Debug, Clone)]
pub struct CostSummary {
    pub total: f64,
    pub breakdown: serde_json::Value,
    pub entries: Vec<CostEntry>,
    pub llm_calls: u64,
    pub tts_seconds: f64,
    pub connected_seconds: u64,
}

/// The ledger
pub struct CostLedger {
    rates: CostRates,
    calls: DashMap<String, Mutex<CallCosts>>,
}

impl CostLedger {
    pub fn new(rates: CostRates) -> Self {
        Self {
            rates,
            calls: DashMap::new(),
        }
    }

    /// Register a call; idempotent.
    pub fn init(&self, call_id: &str) {
        self.calls
            .entry(call_id.to_string())
            .or_insert_with(|| Mutex::new(CallCosts::default()));
    }

    pub fn mark_initiated(&self, call_id: &str) {
        self.with(call_id, |c| {
            c.initiated.get_or_insert_with(Instant::now);
        });
    }

    pub fn mark_connected(&self, call_id: &str) {
        self.with(call_id, |c| {
            c.connected.get_or_insert_with(Instant::now);
        });
    }

    pub fn mark_streaming(&self, call_id: &str) {
        self.with(call_id, |c| {
            c.streaming_started.get_or_insert_with(Instant::now);
        });
    }

    pub fn mark_ended(&self, call_id: &str) {
        self.with(call_id, |c| {
            c.ended.get_or_insert_with(Instant::now);
        });
    }

    pub fn add_stt_seconds(&self, call_id: &str, seconds: f64) {
        self.with(call_id, |c| c.stt_seconds += seconds);
    }

    pub fn add_tts_seconds(&self, call_id: &str, seconds: f64) {
        self.with(call_id, |c| c.tts_seconds += seconds);
    }

    pub fn add_llm_usage(&self, call_id: &str, usage: TokenUsage) {
        self.with(call_id, |c| {
            c.llm_calls += 1;
            c.prompt_tokens += usage.prompt_tokens;
            c.completion_tokens += usage.completion_tokens;
        });
    }

    pub fn add_transfer(&self, call_id: &str) {
        self.with(call_id, |c| c.transfers += 1);
    }

    pub fn llm_calls(&self, call_id: &str) -> u64 {
        self.calls
            .get(call_id)
            .map(|entry| entry.lock().llm_calls)
            .unwrap_or(0)
    }

    pub fn tts_seconds(&self, call_id: &str) -> f64 {
        self.calls
            .get(call_id)
            .map(|entry| entry.lock().tts_seconds)
            .unwrap_or(0.0)
    }

    /// Compute the final totals. The in-memory entry stays cached.
    pub fn finalize(&self, call_id: &str, transferred: bool) -> CostSummary {
        let Some(entry) = self.calls.get(call_id) else {
            return CostSummary {
                total: 0.0,
                breakdown: json!({}),
                entries: Vec::new(),
                llm_calls: 0,
                tts_seconds: 0.0,
                connected_seconds: 0,
            };
        };
        let mut costs = entry.lock();
        costs.ended.get_or_insert_with(Instant::now);
        if transferred && costs.transfers == 0 {
            costs.transfers = 1;
        }

        let connected_seconds = match (costs.connected, costs.ended) {
            (Some(connected), Some(ended)) => ended.duration_since(connected).as_secs(),
            _ => 0,
        };
        // Billed per minute, rounded up, only from connect
        let call_minutes = if connected_seconds > 0 {
            connected_seconds.div_ceil(60)
        } else {
            0
        };
        let stream_seconds = match (costs.streaming_started, costs.ended) {
            (Some(started), Some(ended)) => ended.duration_since(started).as_secs(),
            _ => 0,
        };
        let stream_minutes = if stream_seconds > 0 {
            stream_seconds.div_ceil(60)
        } else {
            0
        };

        let mut entries = Vec::new();
        let rates = &self.rates;

        let call_cost = call_minutes as f64 * rates.carrier_call_per_minute;
        if call_minutes > 0 {
            entries.push(CostEntry {
                service: CostService::CarrierCall,
                quantity: call_minutes as f64,
                unit: "minute",
                cost: call_cost,
            });
        }
        let stream_cost = stream_minutes as f64 * rates.carrier_stream_per_minute;
        if stream_minutes > 0 {
            entries.push(CostEntry {
                service: CostService::CarrierStream,
                quantity: stream_minutes as f64,
                unit: "minute",
                cost: stream_cost,
            });
        }
        let transfer_cost = costs.transfers as f64 * rates.carrier_transfer_fee;
        if costs.transfers > 0 {
            entries.push(CostEntry {
                service: CostService::CarrierTransfer,
                quantity: costs.transfers as f64,
                unit: "transfer",
                cost: transfer_cost,
            });
        }
        let stt_hours = costs.stt_seconds / 3600.0;
        let stt_cost = stt_hours * rates.stt_per_hour;
        if costs.stt_seconds > 0.0 {
            entries.push(CostEntry {
                service: CostService::Stt,
                quantity: stt_hours,
                unit: "hour",
                cost: stt_cost,
            });
        }
        let tts_cost = costs.tts_seconds * rates.tts_per_second;
        if costs.tts_seconds > 0.0 {
            entries.push(CostEntry {
                service: CostService::Tts,
                quantity: costs.tts_seconds,
                unit: "second",
                cost: tts_cost,
            });
        }
        let llm_cost = costs.prompt_tokens as f64 / 1_000_000.0 * rates.llm_prompt_per_million
            + costs.completion_tokens as f64 / 1_000_000.0 * rates.llm_completion_per_million;
        if costs.llm_calls > 0 {
            entries.push(CostEntry {
                service: CostService::Llm,
                quantity: (costs.prompt_tokens + costs.completion_tokens) as f64,
                unit: "token",
                cost: llm_cost,
            });
        }

        let total = call_cost + stream_cost + transfer_cost + stt_cost + tts_cost + llm_cost;
        let breakdown = json!({
            "carrier_call": call_cost,
            "carrier_stream": stream_cost,
            "carrier_transfer": transfer_cost,
            "stt": stt_cost,
            "tts": tts_cost,
            "llm": llm_cost,
            "call_minutes": call_minutes,
            "stream_minutes": stream_minutes,
            "stt_seconds": costs.stt_seconds,
            "tts_seconds": costs.tts_seconds,
            "prompt_tokens": costs.prompt_tokens,
            "completion_tokens": costs.completion_tokens,
            "llm_calls": costs.llm_calls,
        });

        CostSummary {
            total,
            breakdown,
            entries,
            llm_calls: costs.llm_calls,
            tts_seconds: costs.tts_seconds,
            connected_seconds,
        }
    }

    fn with<R>(&self, call_id: &str, f: impl FnOnce(&mut CallCosts) -> R) -> Option<R> {
        self.calls.get(call_id).map(|entry| f(&mut entry.lock()))
    }
}
