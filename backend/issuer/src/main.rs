//! Mints signed bypass codes for venue staff.
//!
//! Only needs `HMAC_CODE_KEY` (`/run/secrets` or environment), the same key the server
//! verifies bypass codes with.
//!
//! ```sh
//! bypass-issuer 20 --prefix GATE
//! bypass-issuer --code STAFF01 --code STAFF02
//! ```
use anyhow::{Context, Result, bail};
use clap::Parser;
use server::{bypass, secrets::BypassSigner};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Number of random codes to mint
    #[arg(default_value_t = 1)]
    count: usize,

    /// Prepended to every random code
    #[arg(long)]
    prefix: Option<String>,

    /// Sign these codes instead of random ones
    #[arg(long = "code")]
    codes: Vec<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let signer = BypassSigner::load().context("Failed to load HMAC_CODE_KEY")?;

    for signed in mint(&signer, args)? {
        println!("{signed}");
    }

    Ok(())
}

fn mint(signer: &BypassSigner, args: Args) -> Result<Vec<String>> {
    let codes: Vec<String> = if args.codes.is_empty() {
        if args.count == 0 {
            bail!("Nothing to mint, count must be positive");
        }

        let prefix = args.prefix.unwrap_or_default();
        (0..args.count)
            .map(|_| format!("{prefix}{}", bypass::random_code()))
            .collect()
    } else {
        args.codes
    };

    codes
        .iter()
        .map(|code| {
            bypass::issue(signer, code)
                .with_context(|| format!("Cannot sign bypass code {code:?}"))
        })
        .collect()
}
