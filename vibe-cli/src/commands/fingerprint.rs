use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use vibe_link::codec::{self, WireFormat};
use vibe_link::dimensions::DIMENSIONS;
use vibe_link::PrivacyAnonymizer;

use crate::cli::ConfigArgs;
use crate::util::{load_config, read_profile};

#[derive(Clone, Debug, clap::Args)]
#[clap(
    name = "fingerprint",
    about = "Derive the advertised fingerprint of a profile and print every encoding"
)]
pub struct Fingerprint {
    #[clap(value_parser, help = "Profile JSON file")]
    profile: PathBuf,

    #[clap(flatten)]
    config: ConfigArgs,
}

impl Fingerprint {
    pub fn run(&self) -> Result<()> {
        let config = load_config(&self.config)?;
        let profile = read_profile(&self.profile)?;
        let anonymizer = PrivacyAnonymizer::new(config.privacy)?;
        let now = Utc::now();
        let fingerprint = anonymizer.derive(&profile, now)?;

        println!("signature:  {}", anonymizer.node_signature(&profile, now)?);
        println!("hash:       {}", fingerprint.hash());
        println!("issued at:  {}", fingerprint.issued_at());
        println!("expires at: {}", fingerprint.expires_at());
        for (name, value) in DIMENSIONS.iter().zip(fingerprint.values()) {
            println!("  {:<20} {:.3}", name, value);
        }

        println!(
            "compact:    {}",
            hex(&codec::encode(&fingerprint, WireFormat::Compact))
        );
        println!(
            "text-safe:  {}",
            String::from_utf8_lossy(&codec::encode(&fingerprint, WireFormat::TextSafe))
        );
        println!(
            "structured: {}",
            String::from_utf8_lossy(&codec::encode(&fingerprint, WireFormat::Structured))
        );
        Ok(())
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
