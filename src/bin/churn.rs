use bpf_table::{Module, TypeDescriptor};
use rand::Rng;
use std::collections::HashSet;
use std::env;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// Scan a table while another thread deletes and re-inserts its keys.
///
/// Keys that are never touched by the churner must show up in every scan.
/// When the scan cursor itself is deleted, `next_key` starts over from the
/// first key, so a round may repeat entries; those repeats are counted.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let total: u32 = env::args()
        .nth(1)
        .map(|arg| arg.parse())
        .transpose()?
        .unwrap_or(5000);
    let rounds: usize = env::args()
        .nth(2)
        .map(|arg| arg.parse())
        .transpose()?
        .unwrap_or(10);
    anyhow::ensure!(total > 0, "need at least one key");

    println!("\n🔁 SCAN UNDER CHURN");
    println!("==================================================");
    println!("▶ Populating {} keys (u32 -> u64)...", total);

    let module = Module::in_memory();
    let table = module.create_table(
        "churn",
        TypeDescriptor::parse("u32")?,
        TypeDescriptor::parse("u64")?,
        total + 16,
    )?;
    let start = Instant::now();
    for k in 1..=total {
        table.set(&k.to_string(), &(u64::from(k) * 10).to_string())?;
    }
    println!("✓ Populated in {:.2?}\n", start.elapsed());

    // Odd keys churn, even keys stay put.
    let stop = Arc::new(AtomicBool::new(false));
    let flips = Arc::new(AtomicUsize::new(0));
    let churner = {
        let table = table.clone();
        let stop = Arc::clone(&stop);
        let flips = Arc::clone(&flips);
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let mut rng = rand::thread_rng();
            while !stop.load(Ordering::Relaxed) {
                let k = rng.gen_range(0..(total + 1) / 2) * 2 + 1;
                if k > total {
                    continue;
                }
                let key = k.to_string();
                if table.delete(&key).is_ok() {
                    table.set(&key, "0")?;
                    flips.fetch_add(1, Ordering::Relaxed);
                }
            }
            Ok(())
        })
    };

    let stable = (total / 2) as usize;
    for round in 1..=rounds {
        let start = Instant::now();
        let entries = table.iter().collect_entries().await?;
        let mut seen = HashSet::new();
        let mut repeats = 0;
        for entry in &entries {
            if !seen.insert(entry.key.clone()) {
                repeats += 1;
            }
        }
        let stable_seen = seen
            .iter()
            .filter_map(|key| key.parse::<u32>().ok())
            .filter(|k| k % 2 == 0)
            .count();
        anyhow::ensure!(
            stable_seen == stable,
            "round {round}: saw {stable_seen} of {stable} untouched keys"
        );
        println!(
            "  🔎 Round {:>2}: {} entries ({} repeats) in {:.2?} | {} flips so far",
            round,
            entries.len(),
            repeats,
            start.elapsed(),
            flips.load(Ordering::Relaxed)
        );
    }

    stop.store(true, Ordering::Relaxed);
    churner.await??;
    println!("\n✅ Every scan saw every untouched key.");
    Ok(())
}
