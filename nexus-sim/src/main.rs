//! nexus-sim
//!
//! Drives one bridge payment through the orchestrator against in-memory
//! chains and prints the unified balance, the estimate, every event and the
//! final state as JSON lines on stdout. Logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nexus_orchestrator::{Amount, BridgeOperation, ChainId, NexusOrchestrator, OrchestratorConfig};
use nexus_test_fixtures::{MockChainConnector, ScriptedSigner, OWNER};

#[derive(Parser)]
#[command(about = "Simulate a cross-chain bridge payment")]
struct Args {
    /// Orchestrator config JSON; defaults to mainnet settings.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "USDC")]
    token: String,
    #[arg(long, default_value = "100")]
    amount: String,
    /// Destination chain id.
    #[arg(long, default_value_t = 137)]
    destination: u64,
    /// Balance seeded on the first source chain; later chains get less.
    #[arg(long, default_value = "1000")]
    balance: String,
    /// Existing allowance on every source chain.
    #[arg(long, default_value = "0")]
    allowance: String,
    /// Have the signer reject the bridge intent.
    #[arg(long)]
    reject_intent: bool,
    /// Make balance reads on this chain fail. Repeatable.
    #[arg(long = "fail-chain")]
    fail_chains: Vec<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nexus_orchestrator=info,nexus_sim=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => OrchestratorConfig::from_json_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => OrchestratorConfig::new(OWNER),
    };

    let chains = config.effective_source_chains();
    let connector = seed_connector(&args, &chains)?;
    let signer = if args.reject_intent {
        ScriptedSigner::rejecting()
    } else {
        ScriptedSigner::approving()
    };

    let orchestrator = NexusOrchestrator::new(config, Arc::new(connector), Arc::new(signer))?;
    let printer = orchestrator.on_any(|event| {
        println!("{}", serde_json::to_string(event)?);
        Ok(())
    });

    let balance = orchestrator
        .get_unified_balance(args.token.as_str(), &chains)
        .await
        .context("balance aggregation failed")?;
    println!("{}", serde_json::to_string(&balance)?);

    let operation = BridgeOperation::new(args.token.as_str(), &args.amount, args.destination)?;
    match orchestrator.estimate(&operation).await {
        Ok(estimate) => println!("{}", serde_json::to_string(&estimate)?),
        Err(err) => tracing::warn!(error = %err, "estimate failed, submitting anyway"),
    }

    let handle = orchestrator.submit(operation).await?;
    let state = orchestrator.wait_for_completion(&handle).await?;
    println!("{}", serde_json::to_string(&state)?);

    drop(printer);
    orchestrator.dispose().await;

    if let Some(error) = state.error {
        anyhow::bail!("operation {} failed: {}", state.operation_id, error);
    }
    Ok(())
}

fn seed_connector(args: &Args, chains: &[ChainId]) -> Result<MockChainConnector> {
    let mut share = Amount::parse(&args.balance)
        .with_context(|| format!("invalid --balance {}", args.balance))?;
    let allowance = Amount::parse(&args.allowance)
        .with_context(|| format!("invalid --allowance {}", args.allowance))?;

    let mut connector = MockChainConnector::new()
        .with_price("USDC", "1")
        .with_price("USDT", "1")
        .with_price("ETH", "3000");

    // Halve the balance for each later chain so route selection is visible.
    for chain in chains {
        connector.set_balance(*chain, &args.token, &share.to_string());
        connector = connector.with_allowance(*chain, &args.token, &allowance.to_string());
        share = Amount::new(share.as_decimal().half())?;
    }
    for chain in &args.fail_chains {
        connector = connector.with_failing_chain(*chain);
    }
    Ok(connector)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("nexus-sim").chain(extra.iter().copied())).unwrap()
    }

    #[test]
    fn malformed_amounts_are_reported_not_panicked() {
        let chains = [ChainId::ETHEREUM, ChainId::OPTIMISM];
        let err = seed_connector(&args(&["--allowance", "abc"]), &chains)
            .err()
            .unwrap();
        assert!(err.to_string().contains("--allowance abc"));

        let err = seed_connector(&args(&["--balance=-5"]), &chains).err().unwrap();
        assert!(err.to_string().contains("--balance -5"));
    }

    #[tokio::test]
    async fn balances_halve_across_chains() {
        use nexus_orchestrator::ChainConnector;

        let chains = [ChainId::ETHEREUM, ChainId::OPTIMISM, ChainId::BASE];
        let connector = seed_connector(&args(&["--balance", "1000"]), &chains).unwrap();
        let owner = nexus_orchestrator::Address::from(OWNER);
        let token = nexus_orchestrator::TokenSymbol::from("USDC");

        let mut seeded = Vec::new();
        for chain in chains {
            let balance = connector.get_balance(chain, &token, &owner).await.unwrap();
            seeded.push(balance.to_string());
        }
        assert_eq!(seeded, vec!["1000", "500", "250"]);
    }
}
