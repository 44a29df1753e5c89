//! `ciphermon simulate` command implementation

use anyhow::{Context, Result};
use ciphermon_core::{
    access::ModelAcl,
    ciphertext::CiphertextTriple,
    event_log::JsonlEventLog,
    events::{FanoutSink, TracingSink},
    metrics::{MetricsSnapshot, MonitorMetrics},
    observability::{MetricsExporter, PrometheusExporter},
    simulator::LocalFheSimulator,
    AlertState, CallerId, Clock, Collaborators, DecryptionOracle, DecryptionProofSigner,
    Ed25519ProofVerifier, ModelId, ModelMetrics, MonitorConfig, MonitorStore, NotificationSink,
    ProofVerifier, RecordId, RecordRegistry, RequestId, RevealCallback, SystemClock,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

use super::check_format;

fn default_caller() -> CallerId {
    CallerId::new("demo-operator")
}

#[derive(Debug, Deserialize)]
struct SimulationInput {
    #[serde(default)]
    records: Vec<RecordInput>,
    #[serde(default)]
    aggregate_updates: Vec<AggregateInput>,
}

#[derive(Debug, Deserialize)]
struct RecordInput {
    model_id: ModelId,
    #[serde(default = "default_caller")]
    caller: CallerId,
    input: u64,
    prediction: u64,
    ground_truth: u64,
    timestamp_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct AggregateInput {
    model_id: ModelId,
    #[serde(default = "default_caller")]
    caller: CallerId,
    accuracy: u64,
    drift: u64,
    error: u64,
}

#[derive(Debug, Serialize)]
struct RecordVerdict {
    record_id: RecordId,
    model_id: ModelId,
    alert: AlertState,
}

#[derive(Debug, Serialize)]
struct ModelReport {
    model_id: ModelId,
    update_count: u64,
    metrics: Option<ModelMetrics>,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    records: Vec<RecordVerdict>,
    models: Vec<ModelReport>,
    rejected: Vec<String>,
    metrics: MetricsSnapshot,
    #[serde(skip)]
    prometheus: String,
}

pub fn run(
    input_path: PathBuf,
    format: String,
    event_log: Option<PathBuf>,
    signing_seed: Option<String>,
    insecure_demo: bool,
    config: MonitorConfig,
) -> Result<()> {
    if !insecure_demo {
        anyhow::bail!(
            "Refusing to simulate without --insecure-demo (the local simulator performs no encryption)."
        );
    }
    check_format(&format)?;

    let raw = fs::read_to_string(&input_path)
        .with_context(|| format!("Failed to read records file: {}", input_path.display()))?;
    let input: SimulationInput =
        serde_json::from_str(&raw).context("Failed to parse records JSON")?;

    let report = simulate(&input, &config, event_log.as_deref(), signing_seed.as_deref())?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_human(&report);
    }
    Ok(())
}

fn simulate(
    input: &SimulationInput,
    config: &MonitorConfig,
    event_log: Option<&Path>,
    signing_seed: Option<&str>,
) -> Result<SimulationReport> {
    let signer = match signing_seed {
        Some(seed) => DecryptionProofSigner::from_hex(seed).context("Invalid signing seed")?,
        None => DecryptionProofSigner::generate(),
    };
    let own_key = signer.verifier().to_bytes();
    let verifier: Arc<dyn ProofVerifier> = match &config.crypto.proof_public_key_hex {
        Some(key) => {
            let configured = Ed25519ProofVerifier::from_hex(key).context("Invalid proof key")?;
            if configured.to_bytes() != own_key {
                warn!("configured proof key does not match the signing seed; reveals will be rejected");
            }
            Arc::new(configured)
        }
        None => Arc::new(signer.verifier()),
    };

    let fhe = Arc::new(LocalFheSimulator::with_signer(signer));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mut sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(TracingSink)];
    if let Some(path) = event_log {
        let log = JsonlEventLog::open(path, clock.clone())
            .with_context(|| format!("Failed to open event log: {}", path.display()))?;
        sinks.push(Arc::new(log));
    }

    let acl = Arc::new(ModelAcl::new(config.access.open_registration));
    let collaborators = Collaborators {
        auth: acl.clone(),
        evaluator: fhe.clone(),
        capability: fhe.clone(),
        verifier,
        sink: Arc::new(FanoutSink::new(sinks)),
        clock: clock.clone(),
    };
    let store = Arc::new(MonitorStore::new());
    let metrics = Arc::new(MonitorMetrics::new());
    let registry =
        RecordRegistry::new(store.clone(), &collaborators, config).with_metrics(metrics.clone());
    let oracle = DecryptionOracle::new(store, &collaborators, config).with_metrics(metrics.clone());

    let mut rejected = Vec::new();
    let mut submitted = Vec::new();
    for r in &input.records {
        let outcome = registry.submit_record(
            &r.caller,
            &r.model_id,
            fhe.encrypt(r.input)?,
            fhe.encrypt(r.prediction)?,
            fhe.encrypt(r.ground_truth)?,
            r.timestamp_ms.unwrap_or_else(|| clock.now_ms()),
        );
        match outcome {
            Ok(id) => submitted.push((id, r.model_id.clone(), r.caller.clone())),
            Err(e) => rejected.push(format!("submit for {}: {e}", r.model_id)),
        }
    }

    for u in &input.aggregate_updates {
        let deltas = CiphertextTriple::new(
            fhe.encrypt(u.accuracy)?,
            fhe.encrypt(u.drift)?,
            fhe.encrypt(u.error)?,
        );
        if let Err(e) = registry.update_aggregate(&u.caller, &u.model_id, &deltas) {
            rejected.push(format!("aggregate update for {}: {e}", u.model_id));
        }
    }

    for (record_id, _, caller) in &submitted {
        if let Err(e) = oracle.request_analysis(caller, *record_id) {
            rejected.push(format!("analysis of {record_id}: {e}"));
        }
    }

    let models = registry.monitored_models()?;
    let mut metric_requests: HashMap<RequestId, ModelId> = HashMap::new();
    for model_id in &models {
        let Some(owner) = acl.owner(model_id) else {
            continue;
        };
        match oracle.request_model_metrics_decryption(&owner, model_id) {
            Ok(request_id) => {
                metric_requests.insert(request_id, model_id.clone());
            }
            Err(e) => rejected.push(format!("metrics for {model_id}: {e}")),
        }
    }

    let mut delivered: HashMap<ModelId, ModelMetrics> = HashMap::new();
    for d in fhe.deliver_all()? {
        match d.callback {
            RevealCallback::Analysis => {
                if let Err(e) = oracle.complete_analysis(d.request_id, d.plaintext, &d.proof) {
                    rejected.push(format!("reveal {}: {e}", d.request_id));
                }
            }
            RevealCallback::ModelMetrics => {
                match oracle.complete_model_metrics_decryption(d.request_id, d.plaintext, &d.proof)
                {
                    Ok(m) => {
                        if let Some(model_id) = metric_requests.get(&d.request_id) {
                            delivered.insert(model_id.clone(), m);
                        }
                    }
                    Err(e) => rejected.push(format!("reveal {}: {e}", d.request_id)),
                }
            }
        }
    }

    let mut records = Vec::with_capacity(submitted.len());
    for (record_id, model_id, _) in submitted {
        records.push(RecordVerdict {
            record_id,
            model_id,
            alert: oracle.get_alert(record_id)?,
        });
    }

    let mut model_reports = Vec::with_capacity(models.len());
    for model_id in models {
        model_reports.push(ModelReport {
            update_count: registry.aggregate(&model_id)?.update_count,
            metrics: delivered.remove(&model_id),
            model_id,
        });
    }

    Ok(SimulationReport {
        records,
        models: model_reports,
        rejected,
        metrics: metrics.snapshot(),
        prometheus: PrometheusExporter::new(metrics).render(),
    })
}

fn print_human(report: &SimulationReport) {
    println!("ciphermon simulation (INSECURE local simulator)");
    println!();
    println!("Records:");
    for r in &report.records {
        if r.alert.revealed {
            println!(
                "   {:<6} {:<20} score {:>3}  {:<8} {}",
                r.record_id.to_string(),
                r.model_id.as_str(),
                r.alert.score,
                r.alert.level.to_string(),
                if r.alert.needs_retraining { "retrain" } else { "" }
            );
        } else {
            println!(
                "   {:<6} {:<20} not revealed",
                r.record_id.to_string(),
                r.model_id.as_str()
            );
        }
    }

    println!();
    println!("Models:");
    for m in &report.models {
        match &m.metrics {
            Some(metrics) => println!(
                "   {:<20} updates {:>3}  accuracy {}  drift {}  error {}",
                m.model_id.as_str(),
                m.update_count,
                metrics.accuracy,
                metrics.drift,
                metrics.error
            ),
            None => println!(
                "   {:<20} updates {:>3}  metrics not delivered",
                m.model_id.as_str(),
                m.update_count
            ),
        }
    }

    if !report.rejected.is_empty() {
        println!();
        println!("Rejected:");
        for reason in &report.rejected {
            println!("   {reason}");
        }
    }

    println!();
    print!("{}", report.prometheus);
}
