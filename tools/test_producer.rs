//! Test Transaction Producer
//!
//! Generates customer transactions and publishes them to the partition
//! subjects the pipeline reads from. A share of records are spikes (far above
//! the customer's usual spend) and a share are malformed, to exercise the
//! alert and reject paths.

use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};
use transaction_anomaly_pipeline::source::partition_for;

/// Record layout accepted by the pipeline's validator
#[derive(Debug, Clone, Serialize)]
struct TransactionRecord {
    transaction_id: String,
    customer_id: String,
    amount: f64,
    timestamp: chrono::DateTime<Utc>,
    merchant: String,
}

/// Per-customer transaction generator
struct TransactionGenerator {
    rng: rand::rngs::ThreadRng,
    transaction_counter: u64,
    /// Typical spend per customer
    baselines: HashMap<String, f64>,
    customers: u32,
}

impl TransactionGenerator {
    fn new(customers: u32) -> Self {
        Self {
            rng: rand::thread_rng(),
            transaction_counter: 0,
            baselines: HashMap::new(),
            customers: customers.max(1),
        }
    }

    fn next_customer(&mut self) -> (String, f64) {
        let customer_id = format!("C{:04}", self.rng.gen_range(1..=self.customers));
        let baseline = match self.baselines.get(&customer_id) {
            Some(b) => *b,
            None => {
                let b = self.rng.gen_range(20.0..800.0);
                self.baselines.insert(customer_id.clone(), b);
                b
            }
        };
        (customer_id, baseline)
    }

    fn generate(&mut self, spike: bool) -> TransactionRecord {
        self.transaction_counter += 1;
        let (customer_id, baseline) = self.next_customer();
        let amount = if spike {
            baseline * self.rng.gen_range(8.0..40.0)
        } else {
            baseline * self.rng.gen_range(0.5..1.5)
        };

        TransactionRecord {
            transaction_id: format!("tx_{:012}", self.transaction_counter),
            customer_id,
            amount: (amount * 100.0).round() / 100.0,
            timestamp: Utc::now(),
            merchant: self
                .random_choice(&["Groceries", "Online", "Fuel", "Travel", "Electronics"])
                .to_string(),
        }
    }

    /// A record the validator rejects (non-numeric amount)
    fn generate_malformed(&mut self) -> serde_json::Value {
        self.transaction_counter += 1;
        let (customer_id, _) = self.next_customer();
        serde_json::json!({
            "transaction_id": format!("tx_{:012}", self.transaction_counter),
            "customer_id": customer_id,
            "amount": "n/a",
            "timestamp": Utc::now(),
        })
    }

    fn random_choice<'a>(&mut self, choices: &[&'a str]) -> &'a str {
        choices[self.rng.gen_range(0..choices.len())]
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("test_producer=info".parse()?),
        )
        .init();

    info!("Starting Test Transaction Producer");

    // Parse arguments
    let args: Vec<String> = std::env::args().collect();
    let nats_url = args.get(1).map(|s| s.as_str()).unwrap_or("nats://localhost:4222");
    let subject_prefix = args.get(2).map(|s| s.as_str()).unwrap_or("transactions");
    let partitions: u32 = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(4);
    let count: u64 = args.get(4).and_then(|s| s.parse().ok()).unwrap_or(100);
    let spike_rate: f64 = args.get(5).and_then(|s| s.parse().ok()).unwrap_or(0.05);
    let malformed_rate: f64 = args.get(6).and_then(|s| s.parse().ok()).unwrap_or(0.01);
    let delay_ms: u64 = args.get(7).and_then(|s| s.parse().ok()).unwrap_or(100);

    info!(
        nats_url = %nats_url,
        subject_prefix = %subject_prefix,
        partitions,
        count,
        spike_rate,
        malformed_rate,
        delay_ms,
        "Configuration loaded"
    );

    let client = match async_nats::connect(nats_url).await {
        Ok(c) => {
            info!("Connected to NATS");
            c
        }
        Err(e) => {
            warn!(error = %e, "Failed to connect to NATS. Running in dry-run mode.");
            return run_dry_mode(count, spike_rate, malformed_rate, delay_ms).await;
        }
    };
    let jetstream = async_nats::jetstream::new(client);

    let mut generator = TransactionGenerator::new(50);
    let mut rng = rand::thread_rng();

    info!("Starting to publish {} transactions...", count);

    let mut normal_count = 0;
    let mut spike_count = 0;
    let mut malformed_count = 0;

    for i in 0..count {
        let (customer_id, payload) = if rng.gen_bool(malformed_rate) {
            malformed_count += 1;
            let record = generator.generate_malformed();
            let customer_id = record["customer_id"].as_str().unwrap_or_default().to_string();
            (customer_id, serde_json::to_vec(&record)?)
        } else {
            let spike = rng.gen_bool(spike_rate);
            if spike {
                spike_count += 1;
            } else {
                normal_count += 1;
            }
            let record = generator.generate(spike);
            (record.customer_id.clone(), serde_json::to_vec(&record)?)
        };

        let subject = format!("{}.{}", subject_prefix, partition_for(&customer_id, partitions));
        let ack = jetstream.publish(subject, payload.into()).await?;
        ack.await?;

        if (i + 1) % 10 == 0 {
            info!(
                "Published {}/{} transactions ({} normal, {} spikes, {} malformed)",
                i + 1,
                count,
                normal_count,
                spike_count,
                malformed_count
            );
        }

        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }

    info!(
        "Completed! Published {} transactions ({} normal, {} spikes, {} malformed)",
        count, normal_count, spike_count, malformed_count
    );

    Ok(())
}

async fn run_dry_mode(
    count: u64,
    spike_rate: f64,
    malformed_rate: f64,
    delay_ms: u64,
) -> anyhow::Result<()> {
    info!("Running in dry-run mode (no NATS connection)");

    let mut generator = TransactionGenerator::new(50);
    let mut rng = rand::thread_rng();

    for i in 0..count {
        let json = if rng.gen_bool(malformed_rate) {
            serde_json::to_string_pretty(&generator.generate_malformed())?
        } else {
            serde_json::to_string_pretty(&generator.generate(rng.gen_bool(spike_rate)))?
        };

        if (i + 1) % 10 == 0 || i == 0 {
            info!("Sample transaction {}:\n{}", i + 1, json);
        }

        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }

    Ok(())
}
