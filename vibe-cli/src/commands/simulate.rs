use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use rand::Rng;
use vibe_link::dimensions::DIMENSION_COUNT;
use vibe_link::{
    ConnectionEvent, ConnectionSubscriber, Engine, Ether, InMemoryProfileStore,
    MemoryTransport, PersonalityProfile, TransportAdapter, TransportKind,
};

use crate::cli::ConfigArgs;
use crate::util::load_config;

#[derive(Clone, Debug, clap::Args)]
#[clap(
    name = "simulate",
    about = "Run several engines on a shared in-memory ether and report their encounters"
)]
pub struct Simulate {
    #[clap(long, default_value_t = 4, help = "Number of simulated nodes")]
    nodes: usize,

    #[clap(long, default_value_t = 10, help = "How long to run, in seconds")]
    seconds: u64,

    #[clap(long, help = "Print every connection state change")]
    verbose: bool,

    #[clap(flatten)]
    config: ConfigArgs,
}

struct StatePrinter {
    node: usize,
}

impl ConnectionSubscriber for StatePrinter {
    fn get_id(&self) -> String {
        format!("printer-{}", self.node)
    }

    fn notify_state(&self, event: ConnectionEvent) {
        let c = event.connection;
        println!("[node {}] {} {} -> {}", self.node, c.id, c.remote, c.state);
    }
}

fn random_profile(owner: String) -> PersonalityProfile {
    let mut rng = rand::thread_rng();
    let mut values = [0.0; DIMENSION_COUNT];
    for value in values.iter_mut() {
        *value = rng.gen_range(0.0..=1.0);
    }
    PersonalityProfile::new(owner, values)
}

impl Simulate {
    pub async fn run(&self) -> Result<()> {
        if self.nodes < 2 {
            return Err(anyhow!("A simulation needs at least two nodes"));
        }
        let mut config = load_config(&self.config)?;
        config.transports = vec![TransportKind::Memory];
        config.storage_dir = None;
        config.discovery_enabled = true;

        let ether = Ether::new();
        let mut engines = Vec::with_capacity(self.nodes);
        for node in 0..self.nodes {
            let profile = random_profile(format!("node-{}", node));
            let store = InMemoryProfileStore::with_policy(profile, config.insights.clone())?;
            let adapter: Arc<dyn TransportAdapter> = Arc::new(MemoryTransport::new(&ether));
            let engine = Engine::start(config.clone(), Arc::new(store), vec![adapter]).await?;
            if self.verbose {
                engine.subscribe(Arc::new(StatePrinter { node }));
            }
            engines.push(engine);
        }
        println!("Running {} nodes for {}s", self.nodes, self.seconds);
        tokio::time::sleep(Duration::from_secs(self.seconds)).await;

        for engine in &engines {
            engine.shutdown().await?;
        }
        for (node, engine) in engines.iter().enumerate() {
            let signature = engine
                .presence()
                .map(|p| p.signature.to_string())
                .unwrap_or_else(|| "-".to_owned());
            let stats = engine.stats();
            println!(
                "node {} ({}): {} sightings, {} encounters",
                node,
                signature,
                stats.sightings,
                engine.history(usize::MAX).len()
            );
            for record in engine.history(usize::MAX) {
                println!("  {}", serde_json::to_string(&record)?);
            }
        }
        Ok(())
    }
}
