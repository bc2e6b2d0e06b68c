//! keyrack - local credential broker CLI
//!
//! "Unlock once, use everywhere in the session, gone when it should be."
//!
//! Talks to the per-session keyrackd daemon for reads, and runs the unlock
//! orchestrator (manifest resolution, vault adapters, grading) for writes.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use keyrack::client::DaemonClient;
use keyrack::loader::{load_host_manifest, load_repo_manifest, save_host_manifest};
use keyrack::unlock::{unlock, UnlockOutcome, UnlockRequest};
use keyrack::vault::VaultRegistry;
use keyrack_core::duration::{format_duration, parse_duration};
use keyrack_core::hostfile::HostKey;
use keyrack_core::slug::{make_slug, resolve_slug, split_slug};
use keyrack_core::{GrantAttempt, HostManifest, Paths, RepoManifest, SessionContext};
use tracing_subscriber::EnvFilter;

/// Exit code for "the key exists but is locked / not unlocked".
const EXIT_LOCKED: i32 = 2;

#[derive(Parser)]
#[command(name = "keyrack")]
#[command(about = "Local credential broker - unlock, fetch, and relock development secrets")]
#[command(version)]
#[command(after_help = "\
Keys are declared per-repository in keyrack.toml and assigned to vaults
per-host with `keyrack set`. Unlocked keys live in a per-login-session
daemon under TTL; nothing plaintext ever touches disk beyond its grade.

EXAMPLES:
    keyrack unlock --env prod            # unlock everything prod needs
    keyrack get --key acme.prod.DB_URL   # print an unlocked secret
    keyrack status                       # what is unlocked, for how long
    keyrack relock --env sudo            # drop sudo grants now
    keyrack set --key DB_URL --env prod --vault age --mech static")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Unlock the keys an environment needs into the session daemon
    Unlock {
        /// Target env (omit for the shared `all` tier)
        #[arg(long)]
        env: Option<String>,

        /// Unlock a single key (slug or bare name); required for sudo
        #[arg(long)]
        key: Option<String>,

        /// TTL, e.g. 30m or 9h (defaults: 30m for sudo, 9h otherwise)
        #[arg(long)]
        duration: Option<String>,

        /// Daemon owner, for isolating parallel toolchains
        #[arg(long, default_value = "default")]
        owner: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print an unlocked secret
    Get {
        /// Key slug or bare name
        #[arg(long)]
        key: String,

        /// Env filter / disambiguator
        #[arg(long)]
        env: Option<String>,

        /// Output the full grant as JSON
        #[arg(long)]
        json: bool,

        /// Daemon owner to query
        #[arg(long = "for", default_value = "default")]
        owner: String,
    },

    /// List live grants and their remaining TTL
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,

        /// Daemon owner to query
        #[arg(long = "for", default_value = "default")]
        owner: String,
    },

    /// Drop grants from the session daemon
    Relock {
        /// Relock only this env
        #[arg(long)]
        env: Option<String>,

        /// Relock only this key (slug or bare name)
        #[arg(long)]
        key: Option<String>,

        /// Daemon owner to target
        #[arg(long = "for", default_value = "default")]
        owner: String,
    },

    /// Record how this host satisfies a key, and store its value
    Set {
        /// Key slug or bare name
        #[arg(long)]
        key: String,

        /// Env the assignment belongs to
        #[arg(long)]
        env: String,

        /// Vault backend (age, file, prompt, external)
        #[arg(long)]
        vault: String,

        /// Acquisition mechanism (static, sso, otp)
        #[arg(long)]
        mech: String,

        /// Owning org (inferred from the repo manifest when omitted)
        #[arg(long)]
        org: Option<String>,

        /// External id passed to the vault adapter
        #[arg(long)]
        exid: Option<String>,

        /// Longest TTL this host permits for the key, e.g. 30m
        #[arg(long)]
        max_duration: Option<String>,
    },

    /// Remove a host assignment
    Del {
        /// Key slug
        #[arg(long)]
        key: String,
    },

    /// List the keys the repo manifest declares
    Keys {
        /// Only this env
        #[arg(long)]
        env: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async { run_command(cli.command).await })
}

async fn run_command(command: Commands) -> Result<()> {
    match command {
        Commands::Unlock { env, key, duration, owner, json } => {
            cmd_unlock(env, key, duration, owner, json).await
        }
        Commands::Get { key, env, json, owner } => cmd_get(key, env, json, owner).await,
        Commands::Status { json, owner } => cmd_status(json, owner).await,
        Commands::Relock { env, key, owner } => cmd_relock(env, key, owner).await,
        Commands::Set { key, env, vault, mech, org, exid, max_duration } => {
            cmd_set(key, env, vault, mech, org, exid, max_duration)
        }
        Commands::Del { key } => cmd_del(key),
        Commands::Keys { env, json } => cmd_keys(env, json),
    }
}

fn repo_manifest() -> Result<Option<RepoManifest>> {
    let cwd = std::env::current_dir()?;
    load_repo_manifest(&cwd)
}

fn host_manifest(paths: &Paths) -> Result<HostManifest> {
    load_host_manifest(&paths.host_manifest())
}

async fn cmd_unlock(
    env: Option<String>,
    key: Option<String>,
    duration: Option<String>,
    owner: String,
    json: bool,
) -> Result<()> {
    let duration = duration.as_deref().map(parse_duration).transpose()?;

    let ctx = SessionContext::current();
    let paths = Paths::new();
    let repo = repo_manifest()?;
    let host = host_manifest(&paths)?;
    let vaults = VaultRegistry::builtin(&paths);

    let req = UnlockRequest { env, key, duration, owner };
    let outcome = unlock(&req, &ctx, repo.as_ref(), &host, &vaults).await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "unlocked": outcome.unlocked,
                "attempts": outcome.attempts,
            }))?
        );
    } else {
        print_attempts(&outcome);
    }

    if outcome.any_locked() {
        std::process::exit(EXIT_LOCKED);
    }
    if !outcome.all_granted() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_attempts(outcome: &UnlockOutcome) {
    if outcome.attempts.is_empty() {
        println!("Nothing to unlock.");
        return;
    }
    for attempt in &outcome.attempts {
        match attempt {
            GrantAttempt::Granted { grant } => {
                let ttl = grant
                    .expires_at
                    .map(|at| format_duration(at - chrono::Utc::now()))
                    .unwrap_or_else(|| "never expires".to_string());
                println!("  unlocked  {:30} [{}] for {}", grant.slug, grant.grade, ttl);
            }
            GrantAttempt::Absent { slug, message, fix } => {
                println!("  absent    {:30} {}", slug, message);
                if let Some(fix) = fix {
                    println!("            fix: {}", fix);
                }
            }
            GrantAttempt::Locked { slug, message, fix } => {
                println!("  locked    {:30} {}", slug, message);
                if let Some(fix) = fix {
                    println!("            fix: {}", fix);
                }
            }
            GrantAttempt::Blocked { slug, reasons, fix } => {
                println!("  blocked   {:30} {}", slug, reasons.join("; "));
                if let Some(fix) = fix {
                    println!("            fix: {}", fix);
                }
            }
        }
    }
}

async fn cmd_get(key: String, env: Option<String>, json: bool, owner: String) -> Result<()> {
    let ctx = SessionContext::current();
    let repo = repo_manifest()?;
    let resolved = resolve_slug(&key, env.as_deref(), repo.as_ref())?;

    let client = DaemonClient::for_owner(&ctx, &owner);
    let keys = client.get(vec![resolved.slug.clone()], None, env).await?;

    let grant = keys.and_then(|mut keys| keys.pop());
    match grant {
        None => {
            eprintln!("{} is locked (not unlocked in this session); run: keyrack unlock --key {}",
                resolved.slug, resolved.slug);
            std::process::exit(EXIT_LOCKED);
        }
        Some(grant) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&grant)?);
            } else {
                println!("{}", grant.secret);
            }
        }
    }
    Ok(())
}

async fn cmd_status(json: bool, owner: String) -> Result<()> {
    let ctx = SessionContext::current();
    let client = DaemonClient::for_owner(&ctx, &owner);

    let entries = match client.status().await? {
        None => {
            if json {
                println!(r#"{{"running": false, "keys": []}}"#);
            } else {
                println!("Daemon: not running (nothing unlocked this session)");
            }
            return Ok(());
        }
        Some(entries) => entries,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "running": true,
                "keys": entries,
            }))?
        );
        return Ok(());
    }

    if entries.is_empty() {
        println!("Daemon: running, nothing unlocked");
        return Ok(());
    }

    println!("{:32} {:8} {:22} {:8} TTL", "KEY", "ENV", "GRADE", "VAULT");
    for entry in entries {
        let ttl = entry
            .ttl_left_ms
            .map(|ms| format_duration(chrono::Duration::milliseconds(ms)))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:32} {:8} {:22} {:8} {}",
            entry.slug,
            entry.env,
            entry.grade.to_string(),
            entry.vault,
            ttl
        );
    }
    Ok(())
}

async fn cmd_relock(env: Option<String>, key: Option<String>, owner: String) -> Result<()> {
    let ctx = SessionContext::current();
    let client = DaemonClient::for_owner(&ctx, &owner);

    let slugs = match key {
        None => None,
        Some(key) => {
            let repo = repo_manifest()?;
            Some(vec![resolve_slug(&key, env.as_deref(), repo.as_ref())?.slug])
        }
    };

    match client.relock(slugs, env).await? {
        None => println!("Daemon: not running, nothing to relock"),
        Some(relocked) => {
            if relocked.is_empty() {
                println!("Nothing matched.");
            } else {
                for slug in &relocked {
                    println!("  relocked  {}", slug);
                }
            }
        }
    }
    Ok(())
}

fn cmd_set(
    key: String,
    env: String,
    vault: String,
    mech: String,
    org: Option<String>,
    exid: Option<String>,
    max_duration: Option<String>,
) -> Result<()> {
    if let Some(d) = max_duration.as_deref() {
        parse_duration(d)?;
    }

    let repo = repo_manifest()?;
    let (slug, org) = match split_slug(&key) {
        Some((slug_org, _, _)) => (key.clone(), org.unwrap_or_else(|| slug_org.to_string())),
        None => {
            let org = org
                .or_else(|| repo.as_ref().map(|r| r.org.clone()))
                .context("pass --org: no repo manifest to infer it from")?;
            (make_slug(&org, &env, &key), org)
        }
    };

    let paths = Paths::new();
    let mut host = host_manifest(&paths)?;
    host.set(
        slug.clone(),
        HostKey {
            vault: vault.clone(),
            mech: mech.clone(),
            env: env.clone(),
            org,
            exid: exid.clone(),
            max_duration,
        },
    );
    save_host_manifest(&paths.host_manifest(), &host)?;
    println!("  assigned  {} -> vault '{}' ({})", slug, vault, mech);

    // Store the value now, for vaults that hold one
    let registry = VaultRegistry::builtin(&paths);
    match registry.get(&vault) {
        None => {
            eprintln!(
                "warning: vault '{}' is not supported by this build (available: {}); assignment recorded anyway",
                vault,
                registry.names().join(", ")
            );
        }
        Some(_) if vault == "prompt" || vault == "external" => {
            println!("  (the '{}' vault holds no stored value)", vault);
        }
        Some(adapter) => {
            adapter.unlock(None, exid.as_deref())?;
            let value = rpassword::prompt_password(format!("Secret value for {}: ", slug))?;
            if value.is_empty() {
                println!("  (no value entered; store one later by re-running set)");
            } else {
                adapter.set(&slug, &value)?;
                println!("  stored    {} in vault '{}'", slug, vault);
            }
        }
    }
    Ok(())
}

fn cmd_del(key: String) -> Result<()> {
    let paths = Paths::new();
    let mut host = host_manifest(&paths)?;
    if !host.del(&key) {
        bail!("no host assignment for {}", key);
    }
    save_host_manifest(&paths.host_manifest(), &host)?;
    println!("  removed   {}", key);
    Ok(())
}

fn cmd_keys(env: Option<String>, json: bool) -> Result<()> {
    let repo = repo_manifest()?
        .context("no keyrack.toml manifest found in this directory or any parent")?;
    let paths = Paths::new();
    let host = host_manifest(&paths)?;

    let mut specs: Vec<_> = match env.as_deref() {
        Some(env) => repo.keys_for_env(env),
        None => repo.keys.values().collect(),
    };
    specs.sort_by(|a, b| a.slug.cmp(&b.slug));

    if json {
        println!("{}", serde_json::to_string_pretty(&specs)?);
        return Ok(());
    }

    if specs.is_empty() {
        println!("No keys declared.");
        return Ok(());
    }

    println!("{:32} {:22} HOST", "KEY", "GRADE");
    for spec in specs {
        let grade = spec.grade.map(|g| g.to_string()).unwrap_or_else(|| "-".to_string());
        let assignment = host
            .get(&spec.slug)
            .map(|hk| format!("{} ({})", hk.vault, hk.mech))
            .unwrap_or_else(|| "unassigned".to_string());
        println!("{:32} {:22} {}", spec.slug, grade, assignment);
    }
    Ok(())
}
