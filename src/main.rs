use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{interval, sleep, Duration};

use tradeswarm::config::Config;
use tradeswarm::logging::{log, obj, ts_epoch_ms, v_num, v_str, Domain, Level};
use tradeswarm::pipeline::{Deps, Swarm};
use tradeswarm::types::{Observation, TextObservation};

const HEADLINES: &[&str] = &[
    "{} beats earnings expectations, raises guidance",
    "Analysts upgrade {} on strong demand",
    "{} faces lawsuit over product recall",
    "{} shares slump after weak outlook",
    "{} announces record buyback",
    "Regulators probe {} accounting practices",
];

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Sinusoid around a slow drift, with noise.
fn synthetic_tick(asset: &str, step: u64, base: f64, rng: &mut StdRng) -> Observation {
    let t = step as f64;
    let close = base + 0.05 * t + 3.0 * (t / 15.0).sin() + rng.gen_range(-0.2..0.2);
    let spread = rng.gen_range(0.05..0.4);
    Observation::new(asset, ts_epoch_ms(), close)
        .with_metric("close", close)
        .with_metric("high", close + spread)
        .with_metric("low", close - spread)
        .with_metric("volume", rng.gen_range(800.0..1200.0))
        .with_metric("bid_size", rng.gen_range(100.0..1000.0))
        .with_metric("ask_size", rng.gen_range(100.0..1000.0))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    let run_secs: u64 = env_or("RUN_SECS", 120);
    let tick_ms: u64 = env_or("FEED_TICK_MS", 500);
    let headline_every: u64 = env_or("FEED_HEADLINE_EVERY", 20);
    let seed: u64 = env_or("FEED_SEED", 42);
    let assets: Vec<String> = std::env::var("FEED_ASSETS")
        .unwrap_or_else(|_| "AAPL,MSFT".to_string())
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();

    log(
        Level::Info,
        Domain::System,
        "start",
        obj(&[
            ("run_secs", v_num(run_secs as f64)),
            ("assets", v_str(&assets.join(","))),
            ("advisory", v_str(if cfg.advisory.api_key.is_some() { "http" } else { "off" })),
        ]),
    );

    let deps = Deps::from_config(&cfg)?;
    let swarm = Swarm::spawn(cfg, deps);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut ticker = interval(Duration::from_millis(tick_ms.max(1)));

    let feed = async {
        let mut step = 0u64;
        loop {
            ticker.tick().await;
            for (i, asset) in assets.iter().enumerate() {
                let base = 150.0 + 50.0 * i as f64;
                swarm.publish_observation(synthetic_tick(asset, step, base, &mut rng));
                if headline_every > 0 && step % headline_every == 0 {
                    let template = HEADLINES[rng.gen_range(0..HEADLINES.len())];
                    swarm.publish_text(TextObservation {
                        source: "synthetic-wire".to_string(),
                        text: template.replace("{}", asset),
                        asset: asset.clone(),
                        timestamp: ts_epoch_ms(),
                    });
                }
            }
            step += 1;
        }
    };

    tokio::select! {
        _ = feed => {}
        _ = sleep(Duration::from_secs(run_secs)) => {}
        _ = tokio::signal::ctrl_c() => {
            log(Level::Warn, Domain::System, "interrupted", obj(&[]));
        }
    }

    swarm.shutdown();
    log(Level::Info, Domain::System, "stop", obj(&[]));
    Ok(())
}
