#![no_main]

use ciphermon_core::access::ModelAcl;
use ciphermon_core::events::MemorySink;
use ciphermon_core::simulator::{LocalFheSimulator, RevealDelivery};
use ciphermon_core::{
    AlertState, CallerId, Collaborators, DecryptionOracle, ManualClock, ModelId, MonitorConfig,
    MonitorError, MonitorStore, PlaintextTriple, RecordId, RecordRegistry, RevealCallback,
};
use libfuzzer_sys::fuzz_target;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug)]
enum Op {
    Submit(u8),
    RequestAnalysis(u8),
    RequestMetrics,
    Deliver,
    CompleteNext,
    ForgeNext(u8),
    Replay(u8),
    AdvanceAndExpire(u8),
}

fn parse_ops(input: &[u8]) -> Vec<Op> {
    let mut ops = Vec::new();
    let mut i = 0usize;

    // Bounded length to keep fuzz runs cheap.
    while i + 1 < input.len() && ops.len() < 256 {
        let arg = input[i + 1];
        let op = match input[i] % 8 {
            0 => Op::Submit(arg),
            1 => Op::RequestAnalysis(arg),
            2 => Op::RequestMetrics,
            3 => Op::Deliver,
            4 => Op::CompleteNext,
            5 => Op::ForgeNext(arg),
            6 => Op::Replay(arg),
            _ => Op::AdvanceAndExpire(arg),
        };
        ops.push(op);
        i += 2;
    }
    ops
}

fn complete(oracle: &DecryptionOracle, d: &RevealDelivery) -> Result<(), MonitorError> {
    match d.callback {
        RevealCallback::Analysis => oracle
            .complete_analysis(d.request_id, d.plaintext, &d.proof)
            .map(|_| ()),
        RevealCallback::ModelMetrics => oracle
            .complete_model_metrics_decryption(d.request_id, d.plaintext, &d.proof)
            .map(|_| ()),
    }
}

fuzz_target!(|data: &[u8]| {
    let ops = parse_ops(data);

    let config = MonitorConfig::builder()
        .request_ttl(Duration::from_secs(10))
        .max_pending_requests(32)
        .build()
        .expect("valid config");
    let fhe = Arc::new(LocalFheSimulator::new());
    let clock = Arc::new(ManualClock::new(0));
    let collaborators = Collaborators {
        auth: Arc::new(ModelAcl::new(true)),
        evaluator: fhe.clone(),
        capability: fhe.clone(),
        verifier: Arc::new(fhe.verifier()),
        sink: Arc::new(MemorySink::new()),
        clock: clock.clone(),
    };
    let store = Arc::new(MonitorStore::new());
    let registry = RecordRegistry::new(store.clone(), &collaborators, &config);
    let oracle = DecryptionOracle::new(store, &collaborators, &config);

    let caller = CallerId::new("fuzzer");
    let model = ModelId::new("fuzz-model").expect("valid model id");

    let mut records: Vec<RecordId> = Vec::new();
    let mut inbox: VecDeque<RevealDelivery> = VecDeque::new();
    let mut consumed: Vec<RevealDelivery> = Vec::new();
    // Model: the first revealed state of a record is final.
    let mut revealed: HashMap<RecordId, AlertState> = HashMap::new();

    for op in ops {
        match op {
            Op::Submit(v) => {
                let v = u64::from(v);
                let id = registry
                    .submit_record(
                        &caller,
                        &model,
                        fhe.encrypt(v).expect("encrypt"),
                        fhe.encrypt(v / 2).expect("encrypt"),
                        fhe.encrypt(v / 3).expect("encrypt"),
                        0,
                    )
                    .expect("submit by owner must succeed");
                if let Some(last) = records.last() {
                    assert!(id > *last, "record ids must increase");
                }
                records.push(id);
            }
            Op::RequestAnalysis(idx) => {
                if records.is_empty() {
                    continue;
                }
                let id = records[usize::from(idx) % records.len()];
                let result = oracle.request_analysis(&caller, id);
                if revealed.contains_key(&id) {
                    assert!(matches!(result, Err(MonitorError::AlreadyAnalyzed(_))));
                }
            }
            Op::RequestMetrics => {
                let _ = oracle.request_model_metrics_decryption(&caller, &model);
            }
            Op::Deliver => {
                inbox.extend(fhe.deliver_all().expect("deliver"));
            }
            Op::CompleteNext => {
                let Some(d) = inbox.pop_front() else { continue };
                let result = complete(&oracle, &d);
                if result.is_ok() {
                    if let RevealCallback::Analysis = d.callback {
                        let record = records
                            .iter()
                            .copied()
                            .find(|r| oracle.get_alert(*r).map(|a| a.revealed).unwrap_or(false)
                                && !revealed.contains_key(r))
                            .expect("a successful reveal reveals exactly one new record");
                        revealed.insert(record, oracle.get_alert(record).expect("alert"));
                    }
                    consumed.push(d);
                } else {
                    assert!(!matches!(result, Err(MonitorError::InvalidProof(_))));
                }
            }
            Op::ForgeNext(delta) => {
                let Some(d) = inbox.front() else { continue };
                let pending_before = oracle.pending_count().expect("pending");
                let mut values = d.plaintext.0;
                values[0] = values[0].wrapping_add(u64::from(delta) + 1);
                let result = complete(
                    &oracle,
                    &RevealDelivery {
                        plaintext: PlaintextTriple(values),
                        ..d.clone()
                    },
                );
                assert!(matches!(result, Err(MonitorError::InvalidProof(_))));
                assert_eq!(oracle.pending_count().expect("pending"), pending_before);
            }
            Op::Replay(idx) => {
                if consumed.is_empty() {
                    continue;
                }
                let d = &consumed[usize::from(idx) % consumed.len()];
                assert!(matches!(
                    complete(&oracle, d),
                    Err(MonitorError::UnknownRequest(_))
                ));
            }
            Op::AdvanceAndExpire(secs) => {
                clock.advance(i64::from(secs) * 1_000);
                oracle.expire_stale_requests().expect("expire");
            }
        }

        for (record, state) in &revealed {
            assert_eq!(oracle.get_alert(*record).expect("alert"), *state);
        }
    }
});
