use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use vibe_link::{CompatibilityAnalyzer, CompatibilityResult, DepthResolver, PrivacyAnonymizer};

use crate::cli::ConfigArgs;
use crate::util::{load_config, read_profile};

#[derive(Clone, Debug, clap::Args)]
#[clap(name = "score", about = "Score two profiles against each other")]
pub struct Score {
    #[clap(value_parser, help = "Local profile JSON file")]
    local: PathBuf,

    #[clap(value_parser, help = "Remote profile JSON file")]
    remote: PathBuf,

    #[clap(long, help = "Compare the raw profiles instead of noised fingerprints")]
    exact: bool,

    #[clap(flatten)]
    config: ConfigArgs,
}

impl Score {
    pub fn run(&self) -> Result<()> {
        let config = load_config(&self.config)?;
        let local = read_profile(&self.local)?;
        let remote = read_profile(&self.remote)?;
        let analyzer = CompatibilityAnalyzer::new(config.analyzer.clone());
        let resolver = DepthResolver::new(
            config.analyzer.compatibility_floor,
            config.analyzer.max_share_depth,
        );

        let (forward, backward) = if self.exact {
            let (l, r) = (local.validate()?, remote.validate()?);
            (analyzer.score_values(&l, &r), analyzer.score_values(&r, &l))
        } else {
            let anonymizer = PrivacyAnonymizer::new(config.privacy)?;
            let now = Utc::now();
            let l = anonymizer.derive(&local, now)?;
            let r = anonymizer.derive(&remote, now)?;
            (analyzer.score(&l, &r), analyzer.score(&r, &l))
        };

        print_side(&local.owner_id, &forward, &resolver);
        print_side(&remote.owner_id, &backward, &resolver);

        let resolution = resolver.resolve(
            resolver.desired(&forward),
            resolver.desired(&backward),
        );
        if resolver.passes_floor(&forward) && resolver.passes_floor(&backward) {
            println!(
                "effective depth {:.2} ({}), {} insights per side",
                resolution.effective.value(),
                resolution.effective_tier(),
                resolution.effective_tier().insight_budget()
            );
        } else {
            println!("below the compatibility floor, no exchange");
        }
        Ok(())
    }
}

fn print_side(owner: &str, result: &CompatibilityResult, resolver: &DepthResolver) {
    println!(
        "{}: score {:.3}, tier {}, desired depth {:.2}",
        owner,
        result.score,
        result.recommended_tier,
        resolver.desired(result).value()
    );
    for delta in &result.learning_opportunities {
        println!(
            "  {:<20} {:.2} -> {:.2} ({:+.2})",
            delta.dimension, delta.local, delta.remote, delta.delta
        );
    }
}
