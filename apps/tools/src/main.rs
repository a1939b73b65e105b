use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use rules_core::{bus::ChangeBus, manager::RuleManager, DurableRuleStore, RuleStore};
use shared::domain::{OutboundTarget, ProfileId, RouteRule, RuleId};
use storage::Storage;
use tracing::error;

mod settings;

use settings::{load_settings, prepare_database_url};

#[derive(Parser, Debug)]
struct Cli {
    /// Overrides the database url from routeboard.toml / the environment.
    #[arg(long)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Prints every rule in listing order.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Appends a rule at the end of the listing.
    Add {
        name: String,
        #[arg(long, default_value = "")]
        domains: String,
        #[arg(long, default_value = "")]
        ip: String,
        #[arg(long, default_value = "")]
        port: String,
        #[arg(long, default_value = "")]
        network: String,
        #[arg(long, default_value = "")]
        source: String,
        #[arg(long, default_value = "")]
        protocol: String,
        /// proxy, direct, block or a profile id.
        #[arg(long, default_value = "proxy")]
        outbound: String,
    },
    Enable {
        id: i64,
    },
    Disable {
        id: i64,
    },
    Delete {
        #[arg(required = true)]
        ids: Vec<i64>,
    },
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let cli = Cli::parse();
    let settings = load_settings();
    let raw_url = cli.database_url.unwrap_or(settings.database_url);
    let database_url = prepare_database_url(&raw_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let store = DurableRuleStore::from_storage(storage);
    let manager = RuleManager::new(Arc::clone(&store) as Arc<dyn RuleStore>, ChangeBus::default());

    match cli.command {
        Command::List { json } => {
            let rules = store.list_ordered().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rules)?);
            } else if rules.is_empty() {
                println!("no rules configured");
            } else {
                for (index, rule) in rules.iter().enumerate() {
                    let state = if rule.enabled { "on" } else { "off" };
                    println!(
                        "{} [{state}] {}: {}",
                        index + 1,
                        rule.display_name(),
                        rule.summary()
                    );
                }
            }
        }
        Command::Add {
            name,
            domains,
            ip,
            port,
            network,
            source,
            protocol,
            outbound,
        } => {
            let mut rule = RouteRule::new(name);
            rule.domains = domains;
            rule.ip = ip;
            rule.port = port;
            rule.network = network;
            rule.source = source;
            rule.protocol = protocol;
            rule.outbound = parse_outbound(&outbound)?;
            let created = manager.create_rule(rule).await?;
            println!("created rule_id={} ({})", created.id.0, created.summary());
        }
        Command::Enable { id } => {
            set_rule_enabled(&store, &manager, RuleId(id), true).await?;
        }
        Command::Disable { id } => {
            set_rule_enabled(&store, &manager, RuleId(id), false).await?;
        }
        Command::Delete { ids } => {
            let ids: Vec<RuleId> = ids.into_iter().map(RuleId).collect();
            manager.delete_rules(&ids).await?;
            for id in &ids {
                println!("removed rule_id={}", id.0);
            }
        }
        Command::Clear => {
            manager.clear_rules().await?;
            println!("cleared all rules");
        }
    }

    Ok(())
}

async fn set_rule_enabled(
    store: &DurableRuleStore,
    manager: &RuleManager,
    id: RuleId,
    enabled: bool,
) -> Result<()> {
    let word = if enabled { "enabled" } else { "disabled" };
    let Some(mut rule) = store.storage().get_rule(id).await? else {
        bail!("no rule with id {}", id.0);
    };
    if rule.enabled == enabled {
        println!("rule_id={} is already {word}", id.0);
        return Ok(());
    }

    rule.enabled = enabled;
    manager.update_rule(rule).await?;
    println!("rule_id={} {word}", id.0);
    Ok(())
}

fn parse_outbound(raw: &str) -> Result<OutboundTarget> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("proxy") {
        return Ok(OutboundTarget::Proxy);
    }
    if raw.eq_ignore_ascii_case("direct") {
        return Ok(OutboundTarget::Direct);
    }
    if raw.eq_ignore_ascii_case("block") {
        return Ok(OutboundTarget::Block);
    }
    match raw.parse::<i64>() {
        Ok(id) if id > 0 => Ok(OutboundTarget::Profile(ProfileId(id))),
        _ => bail!("unknown outbound '{raw}', expected proxy, direct, block or a profile id"),
    }
}
