//! Caddyman CLI - manage sites fronted by a Caddy server
//!
//! Usage:
//!   caddyman sites list                 List all sites
//!   caddyman sites show <id>            Show one site
//!   caddyman sites create [flags]       Create a site and its route
//!   caddyman sites update <id> [flags]  Update a site
//!   caddyman sites delete <id>          Delete a site and its route
//!   caddyman sites toggle <id>          Enable/disable a site
//!
//!   caddyman settings list|get|set      Manage settings (caddy_api_url)
//!   caddyman log [--site <id>] [-n N]   Show recent activity
//!   caddyman status                     Probe the Caddy admin API

use anyhow::{bail, Context, Result};
use caddyman::caddy::{CaddyClient, CaddyStatus};
use caddyman::config::Config;
use caddyman::db::{Database, CADDY_API_URL_KEY};
use caddyman::sites::{NewSite, Site, SiteConfig, SiteManager, SiteType, SiteUpdate};
use caddyman::sync::ConfigSynchronizer;
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Site-related flags shared by `sites create` and `sites update`
#[derive(Debug, Default)]
struct SiteFlags {
    name: Option<String>,
    domain: Option<String>,
    site_type: Option<SiteType>,
    target: Option<String>,
    preserve_path: Option<bool>,
    strip_prefix: Option<bool>,
    headers: Vec<(String, String)>,
    root: Option<String>,
    index_names: Option<Vec<String>>,
    try_files: Option<Vec<String>>,
}

#[derive(Debug)]
enum Command {
    Help,
    Status,
    SitesList,
    SitesShow(String),
    SitesCreate(SiteFlags),
    SitesUpdate(String, SiteFlags),
    SitesDelete(String),
    SitesToggle(String),
    SettingsList,
    SettingsGet(String),
    SettingsSet { key: String, value: String },
    Log { site_id: Option<String>, limit: usize },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let mut args: Vec<String> = env::args().skip(1).collect();

    // Global --config flag
    let mut config_path = PathBuf::from("caddyman.toml");
    if let Some(pos) = args.iter().position(|a| a == "--config") {
        if pos + 1 >= args.len() {
            bail!("--config requires a path");
        }
        config_path = PathBuf::from(args.remove(pos + 1));
        args.remove(pos);
    }

    let command = parse_command(&args)?;
    if matches!(command, Command::Help) {
        print_usage();
        return Ok(());
    }

    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    let db = Arc::new(Database::open(&config.database.path)?);
    db.ensure_user(
        &config.system.account,
        &config.system.email,
        &config.system.name,
        "admin",
    )?;

    // The settings row wins over the config-file fallback
    let api_url = db
        .get_setting(CADDY_API_URL_KEY)?
        .unwrap_or_else(|| config.caddy.api_url.clone());
    let client = CaddyClient::new(&api_url, Duration::from_secs(config.caddy.timeout_secs))?;

    let manager = SiteManager::new(
        db.clone(),
        ConfigSynchronizer::new(client.clone()),
        config.system.account.clone(),
    );

    match command {
        Command::Help => unreachable!(),
        Command::Status => {
            match client.check_status().await {
                CaddyStatus::Running => println!("Caddy admin API at {} is reachable", api_url),
                CaddyStatus::Unreachable(reason) => {
                    println!("Caddy admin API at {} is unreachable: {}", api_url, reason);
                    std::process::exit(1);
                }
            }
        }
        Command::SitesList => {
            let sites = manager.list_sites()?;
            if sites.is_empty() {
                println!("No sites configured");
            }
            for site in sites {
                println!(
                    "{}  {}  {}  [{}]  {}",
                    site.id,
                    site.domain,
                    site.site_type,
                    if site.enabled { "enabled" } else { "disabled" },
                    site.name
                );
            }
        }
        Command::SitesShow(id) => {
            let site = manager.get_site(&id)?;
            println!("{}", serde_json::to_string_pretty(&site)?);
        }
        Command::SitesCreate(flags) => {
            let new_site = build_new_site(flags)?;
            let site = manager
                .create_site(new_site, None)
                .await?;
            println!("Created site {} ({})", site.id, site.domain);
        }
        Command::SitesUpdate(id, flags) => {
            let existing = manager.get_site(&id)?;
            let update = build_site_update(&existing, flags)?;
            let site = manager
                .update_site(&id, update, None)
                .await?;
            println!("Updated site {} ({})", site.id, site.domain);
        }
        Command::SitesDelete(id) => {
            let site = manager
                .delete_site(&id, None)
                .await?;
            println!("Deleted site {} ({})", site.id, site.domain);
        }
        Command::SitesToggle(id) => {
            let site = manager
                .toggle_site(&id, None)
                .await?;
            println!(
                "Site {} is now {}",
                site.id,
                if site.enabled { "enabled" } else { "disabled" }
            );
        }
        Command::SettingsList => {
            for setting in db.list_settings()? {
                println!("{} = {}", setting.key, setting.value);
            }
        }
        Command::SettingsGet(key) => match db.get_setting(&key)? {
            Some(value) => println!("{}", value),
            None => {
                println!("(not set)");
                std::process::exit(1);
            }
        },
        Command::SettingsSet { key, value } => {
            db.set_setting(&key, &value, None)?;
            db.append_activity(
                "update",
                "setting",
                Some(&key),
                &serde_json::json!({ "value": value }),
                &config.system.account,
            )?;
            println!("Setting {} updated", key);
        }
        Command::Log { site_id, limit } => {
            let entries = match site_id {
                Some(id) => db.list_activity_for("site", Some(&id), limit)?,
                None => db.list_activity(limit)?,
            };
            for entry in entries {
                println!(
                    "{}  {}  {} {}  by {}",
                    entry.performed_at,
                    entry.action,
                    entry.entity,
                    entry.entity_id.as_deref().unwrap_or("-"),
                    entry.performed_by
                );
            }
        }
    }

    Ok(())
}

fn parse_command(args: &[String]) -> Result<Command> {
    if args.is_empty() {
        return Ok(Command::Help);
    }

    match args[0].as_str() {
        "help" | "--help" | "-h" => Ok(Command::Help),
        "status" => Ok(Command::Status),
        "sites" | "site" => parse_sites_command(&args[1..]),
        "settings" | "setting" => parse_settings_command(&args[1..]),
        "log" | "logs" => parse_log_command(&args[1..]),
        other => bail!("unknown command '{}', try 'caddyman help'", other),
    }
}

fn parse_sites_command(args: &[String]) -> Result<Command> {
    let Some(sub) = args.first() else {
        return Ok(Command::SitesList);
    };

    match sub.as_str() {
        "list" | "ls" => Ok(Command::SitesList),
        "show" | "info" => Ok(Command::SitesShow(required_id(args)?)),
        "create" | "add" => Ok(Command::SitesCreate(parse_site_flags(&args[1..])?)),
        "update" => {
            let id = required_id(args)?;
            Ok(Command::SitesUpdate(id, parse_site_flags(&args[2..])?))
        }
        "delete" | "remove" | "rm" => Ok(Command::SitesDelete(required_id(args)?)),
        "toggle" => Ok(Command::SitesToggle(required_id(args)?)),
        other => bail!("unknown sites subcommand '{}'", other),
    }
}

fn parse_settings_command(args: &[String]) -> Result<Command> {
    let Some(sub) = args.first() else {
        return Ok(Command::SettingsList);
    };

    match sub.as_str() {
        "list" | "ls" => Ok(Command::SettingsList),
        "get" => Ok(Command::SettingsGet(required_id(args)?)),
        "set" => {
            let key = args.get(1).cloned().context("settings set requires a key")?;
            let value = args
                .get(2)
                .cloned()
                .context("settings set requires a value")?;
            Ok(Command::SettingsSet { key, value })
        }
        other => bail!("unknown settings subcommand '{}'", other),
    }
}

fn parse_log_command(args: &[String]) -> Result<Command> {
    let mut site_id = None;
    let mut limit = 50;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--site" => {
                site_id = Some(flag_value(args, &mut i, "--site")?);
            }
            "-n" | "--limit" => {
                let raw = flag_value(args, &mut i, "--limit")?;
                limit = raw.parse().with_context(|| format!("invalid limit '{}'", raw))?;
            }
            other => bail!("unknown log flag '{}'", other),
        }
        i += 1;
    }

    Ok(Command::Log { site_id, limit })
}

fn required_id(args: &[String]) -> Result<String> {
    args.get(1)
        .cloned()
        .with_context(|| format!("'{}' requires an argument", args[0]))
}

fn flag_value(args: &[String], i: &mut usize, flag: &str) -> Result<String> {
    *i += 1;
    args.get(*i)
        .cloned()
        .with_context(|| format!("{} requires a value", flag))
}

fn parse_site_flags(args: &[String]) -> Result<SiteFlags> {
    let mut flags = SiteFlags::default();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--name" => flags.name = Some(flag_value(args, &mut i, "--name")?),
            "--domain" => flags.domain = Some(flag_value(args, &mut i, "--domain")?),
            "--type" => {
                let raw = flag_value(args, &mut i, "--type")?;
                flags.site_type = Some(match raw.as_str() {
                    "reverse_proxy" | "proxy" => SiteType::ReverseProxy,
                    "static" => SiteType::Static,
                    other => bail!("unknown site type '{}'", other),
                });
            }
            "--target" => flags.target = Some(flag_value(args, &mut i, "--target")?),
            "--preserve-path" => flags.preserve_path = Some(true),
            "--strip-prefix" => flags.strip_prefix = Some(true),
            "--header" => {
                let raw = flag_value(args, &mut i, "--header")?;
                let (key, value) = raw
                    .split_once('=')
                    .with_context(|| format!("--header expects KEY=VALUE, got '{}'", raw))?;
                flags.headers.push((key.to_string(), value.to_string()));
            }
            "--root" => flags.root = Some(flag_value(args, &mut i, "--root")?),
            "--index" => {
                let raw = flag_value(args, &mut i, "--index")?;
                flags.index_names = Some(raw.split(',').map(str::to_string).collect());
            }
            "--try-files" => {
                let raw = flag_value(args, &mut i, "--try-files")?;
                flags.try_files = Some(raw.split(',').map(str::to_string).collect());
            }
            other => bail!("unknown flag '{}'", other),
        }
        i += 1;
    }

    Ok(flags)
}

fn build_new_site(flags: SiteFlags) -> Result<NewSite> {
    let domain = flags.domain.clone().context("--domain is required")?;
    let name = flags.name.clone().unwrap_or_else(|| domain.clone());
    let site_type = flags.site_type.context("--type is required")?;

    let config = match site_type {
        SiteType::ReverseProxy => SiteConfig::ReverseProxy {
            target_url: flags
                .target
                .context("--target is required for reverse proxy sites")?,
            preserve_path: flags.preserve_path.unwrap_or(false),
            strip_prefix: flags.strip_prefix.unwrap_or(false),
            headers: flags.headers.into_iter().collect(),
        },
        SiteType::Static => SiteConfig::Static {
            root: flags.root.context("--root is required for static sites")?,
            index_names: flags.index_names,
            try_files: flags.try_files,
        },
    };

    Ok(NewSite {
        name,
        domain,
        config,
    })
}

/// Merge update flags over the existing site; unspecified flags keep their
/// stored values. The type cannot change.
fn build_site_update(existing: &Site, flags: SiteFlags) -> Result<SiteUpdate> {
    if let Some(requested) = flags.site_type {
        if requested != existing.site_type {
            bail!("site type cannot be changed; delete and recreate instead");
        }
    }

    let config = match &existing.config {
        SiteConfig::ReverseProxy {
            target_url,
            preserve_path,
            strip_prefix,
            headers,
        } => SiteConfig::ReverseProxy {
            target_url: flags.target.unwrap_or_else(|| target_url.clone()),
            preserve_path: flags.preserve_path.unwrap_or(*preserve_path),
            strip_prefix: flags.strip_prefix.unwrap_or(*strip_prefix),
            headers: if flags.headers.is_empty() {
                headers.clone()
            } else {
                flags.headers.into_iter().collect::<BTreeMap<_, _>>()
            },
        },
        SiteConfig::Static {
            root,
            index_names,
            try_files,
        } => SiteConfig::Static {
            root: flags.root.unwrap_or_else(|| root.clone()),
            index_names: flags.index_names.or_else(|| index_names.clone()),
            try_files: flags.try_files.or_else(|| try_files.clone()),
        },
    };

    Ok(SiteUpdate {
        name: flags.name.unwrap_or_else(|| existing.name.clone()),
        domain: flags.domain.unwrap_or_else(|| existing.domain.clone()),
        config,
    })
}

fn print_usage() {
    println!("caddyman - manage sites fronted by a Caddy server");
    println!();
    println!("Usage: caddyman [--config <path>] <command>");
    println!();
    println!("Commands:");
    println!("  sites list                     List all sites");
    println!("  sites show <id>                Show one site as JSON");
    println!("  sites create --domain <d> --type reverse_proxy --target <addr>");
    println!("               [--name <n>] [--header K=V]... [--preserve-path] [--strip-prefix]");
    println!("  sites create --domain <d> --type static --root <path>");
    println!("               [--index a,b] [--try-files a,b]");
    println!("  sites update <id> [flags]      Update a site (same flags as create)");
    println!("  sites delete <id>              Delete a site and its route");
    println!("  sites toggle <id>              Enable/disable a site (bookkeeping only)");
    println!();
    println!("  settings list                  List settings");
    println!("  settings get <key>             Read a setting");
    println!("  settings set <key> <value>     Write a setting (e.g. caddy_api_url)");
    println!();
    println!("  log [--site <id>] [-n N]       Show recent activity");
    println!("  status                         Probe the Caddy admin API");
}
