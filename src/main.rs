/*
    Ben-Or style randomized binary consensus. N nodes, at most F of them
    faulty, each start from a bit and must all commit the same bit. Rounds
    alternate a Propose phase, where nodes exchange their estimates, and a
    Decide phase, where they exchange the strict majority they saw (or "?").
    f + 1 matching Decide votes commit; otherwise nodes carry the majority of
    the Decide votes, or a coin flip, into the next round.

    This binary runs a whole cluster in one process over channels.
*/

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ben_or::{
    consensus::{ConsensusConfig, FaultMode, Value},
    LocalCluster,
};

#[derive(Parser, Debug)]
#[command(name = "ben-or", about = "Run a randomized binary consensus cluster in-process")]
struct Args {
    /// JSON config file; command line flags override it.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(short = 'n', long)]
    nodes: Option<usize>,

    #[arg(short = 'f', long)]
    faults: Option<usize>,

    /// Initial bits, e.g. 0,0,1,1. Defaults to alternating bits.
    #[arg(long, value_delimiter = ',')]
    initial: Vec<u8>,

    /// Ids of faulty nodes.
    #[arg(long, value_delimiter = ',')]
    faulty: Vec<usize>,

    /// Faulty nodes send random votes instead of staying silent.
    #[arg(long)]
    random_faults: bool,

    #[arg(long)]
    max_rounds: Option<u64>,

    /// Run rounds until every node decides.
    #[arg(long, conflicts_with = "max_rounds")]
    unbounded: bool,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,
}

impl Args {
    fn to_config(&self) -> Result<ConsensusConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => ConsensusConfig::load(path)?,
            None => ConsensusConfig::new(4, 1),
        };
        if let Some(nodes) = self.nodes {
            config.n = nodes;
        }
        if let Some(faults) = self.faults {
            config.f = faults;
        }
        if self.random_faults {
            config.fault_mode = FaultMode::Random;
        }
        if self.max_rounds.is_some() {
            config.max_rounds = self.max_rounds;
        }
        if self.unbounded {
            config.max_rounds = None;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        config.validate()?;
        Ok(config)
    }

    fn initial_values(&self, n: usize) -> Result<Vec<Value>, String> {
        if self.initial.is_empty() {
            return Ok((0..n).map(|id| Value::from_bit(id % 2 == 1)).collect());
        }
        self.initial
            .iter()
            .map(|bit| match bit {
                0 => Ok(Value::Zero),
                1 => Ok(Value::One),
                other => Err(format!("initial value must be 0 or 1, got {other}")),
            })
            .collect()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = args.to_config()?;
    let initial = args.initial_values(config.n)?;

    info!(
        n = config.n,
        f = config.f,
        max_rounds = ?config.max_rounds,
        faulty = ?args.faulty,
        "starting cluster"
    );
    let cluster = LocalCluster::spawn(config, &initial, &args.faulty)?;

    for (id, result) in cluster.start_all().await.into_iter().enumerate() {
        if let Err(err) = result {
            info!(node = id, %err, "node did not start");
        }
    }

    let settled = cluster
        .wait_settled(Duration::from_secs(args.timeout_secs), Duration::from_millis(20))
        .await;
    if !settled {
        warn!("timed out before every node settled");
    }

    let snapshots = cluster.snapshots().await;
    println!("{}", serde_json::to_string_pretty(&snapshots)?);
    Ok(())
}
