//! `freetier check`, `freetier use` and `freetier usage` command handlers.

use anyhow::Result;

use freetier::config::Config;
use freetier::ledger::UsageSnapshot;

use super::common::{build_client, parse_feature, resolve_identity};
use super::IdentityArgs;

fn remaining_label(snapshot: &UsageSnapshot) -> String {
    match snapshot.remaining {
        Some(n) => n.to_string(),
        None => "unlimited".to_string(),
    }
}

fn print_snapshot(snapshot: &UsageSnapshot) {
    println!("  Used:      {}/{}", snapshot.used, snapshot.cap);
    println!("  Remaining: {}", remaining_label(snapshot));
    println!("  Premium:   {}", snapshot.is_premium);
    println!("  Day:       {}", snapshot.day);
    println!("  Resets at: {}", snapshot.resets_at.to_rfc3339());
}

/// Handle `freetier check`.
pub(crate) async fn cmd_check(config: &Config, who: &IdentityArgs) -> Result<()> {
    let identity = resolve_identity(config, who)?;
    let feature = parse_feature(who)?;
    let client = build_client(config)?;

    let check = client.get_usage(&identity, feature).await?;
    println!(
        "{} {}: {}",
        identity,
        feature,
        if check.allowed { "allowed" } else { "daily limit reached" }
    );
    print_snapshot(&check.snapshot);
    Ok(())
}

/// Handle `freetier use`.
pub(crate) async fn cmd_use(config: &Config, who: &IdentityArgs) -> Result<()> {
    let identity = resolve_identity(config, who)?;
    let feature = parse_feature(who)?;
    let client = build_client(config)?;

    let grant = client.record_use(&identity, feature).await?;
    if grant.success {
        println!("Recorded one {} for {}.", feature, identity);
    } else {
        println!(
            "Daily {} limit reached for {}. Upgrade for unlimited access.",
            feature, identity
        );
    }
    print_snapshot(&grant.snapshot);
    if !grant.success {
        anyhow::bail!("daily limit reached");
    }
    Ok(())
}

/// Handle `freetier usage`.
pub(crate) async fn cmd_usage(config: &Config, who: &IdentityArgs, days: u32) -> Result<()> {
    let identity = resolve_identity(config, who)?;
    let feature = parse_feature(who)?;
    let client = build_client(config)?;
    let ledger = client.ledger();

    let history = ledger.history(&identity, feature, days).await?;
    if history.is_empty() {
        println!("No {} usage recorded for {} in the last {} day(s).", feature, identity, days.max(1));
        return Ok(());
    }

    let cap = ledger.cap(feature);
    println!("{:<12} {:<8} {:<8}", "Day", "Used", "Cap");
    println!("{}", "-".repeat(28));
    for (day, used) in history {
        println!("{:<12} {:<8} {:<8}", day.to_string(), used, cap);
    }
    Ok(())
}
