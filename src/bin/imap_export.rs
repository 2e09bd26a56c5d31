use anyhow::{Context, Result, anyhow};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

use imap_export::auth::credentials::{CredentialSource, OAuthStore, StaticSecret};
use imap_export::auth::oauth::OAuthClient;
use imap_export::auth::token_file::TokenFile;
use imap_export::auth::token_store;
use imap_export::config::{Config, load_config, write_template};
use imap_export::domain::request::FetchRequest;
use imap_export::engine::progress::{ExportSummary, ProgressEvent};
use imap_export::engine::{CancelToken, Exporter};
use imap_export::mail::decoders::MessageDecoder;
use imap_export::providers::{
    AuthKind, CUSTOM_PROVIDER, ConnectionProfile, CustomServer, ProviderTable, TlsMode,
};

#[derive(Parser)]
#[command(name = "imap_export")]
#[command(about = "Export a date range of an IMAP folder to CSV", long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/imap_export/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum TlsArg {
    Implicit,
    Starttls,
    Plain,
}

impl From<TlsArg> for TlsMode {
    fn from(t: TlsArg) -> Self {
        match t {
            TlsArg::Implicit => TlsMode::Implicit,
            TlsArg::Starttls => TlsMode::StartTls,
            TlsArg::Plain => TlsMode::Plain,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum AuthArg {
    Password,
    Oauth2,
}

impl From<AuthArg> for AuthKind {
    fn from(a: AuthArg) -> Self {
        match a {
            AuthArg::Password => AuthKind::Password,
            AuthArg::Oauth2 => AuthKind::OAuth2,
        }
    }
}

#[derive(Args)]
struct ConnectionArgs {
    /// Mailbox address
    #[arg(long)]
    email: String,

    /// Provider key (see `providers`); detected from the address when omitted
    #[arg(long)]
    provider: Option<String>,

    /// Server host for the custom provider
    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u32>,

    #[arg(long, value_enum)]
    tls: Option<TlsArg>,

    /// Override the provider's authentication kind (e.g. app password on gmail)
    #[arg(long, value_enum)]
    auth: Option<AuthArg>,

    /// Password or app password; prompted for when not given
    #[arg(long, env = "IMAP_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Export messages received in a date range
    Export {
        #[command(flatten)]
        conn: ConnectionArgs,

        #[arg(long, default_value = "INBOX")]
        folder: String,

        /// First day, YYYY-MM-DD (inclusive)
        #[arg(long)]
        since: NaiveDate,

        /// Last day, YYYY-MM-DD (inclusive)
        #[arg(long)]
        until: NaiveDate,

        #[arg(long, short)]
        output: PathBuf,

        /// Messages per batch (default from config)
        #[arg(long)]
        batch_size: Option<usize>,

        /// Start the CSV with a UTF-8 BOM
        #[arg(long)]
        bom: bool,
    },

    /// List folders of a mailbox
    Folders {
        #[command(flatten)]
        conn: ConnectionArgs,
    },

    /// List known providers
    Providers,

    /// Run the OAuth2 authorization now and store the token
    Authorize {
        #[arg(long)]
        email: String,

        #[arg(long, default_value = "gmail")]
        provider: String,
    },

    /// Store the OAuth client secret in keyring
    SetClientSecret {
        #[arg(long)]
        client_id: String,
    },

    /// Write a template config file
    InitConfig,
}

fn resolve_profile(table: &ProviderTable, conn: &ConnectionArgs) -> Result<ConnectionProfile> {
    let key = match (&conn.provider, &conn.host) {
        (Some(key), _) => key.clone(),
        (None, Some(_)) => CUSTOM_PROVIDER.to_string(),
        (None, None) => table.detect(&conn.email).map(str::to_string).ok_or_else(|| {
            anyhow!(
                "cannot tell the provider of {}; pass --provider or --host",
                conn.email
            )
        })?,
    };

    let custom = conn.host.as_ref().map(|host| CustomServer {
        host: host.clone(),
        port: conn.port.unwrap_or(993),
        tls: conn.tls.map(TlsMode::from).unwrap_or(TlsMode::Implicit),
        auth: conn.auth.map(AuthKind::from).unwrap_or(AuthKind::Password),
    });

    let profile = table.resolve(&key, custom.as_ref())?;
    Ok(match conn.auth {
        Some(auth) => profile.with_auth(auth.into()),
        None => profile,
    })
}

fn prompt_password(email: &str) -> Result<String> {
    eprint!("Password for {email}: ");
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let secret = line.trim_end_matches(['\r', '\n']).to_string();
    if secret.is_empty() {
        return Err(anyhow!("no password given"));
    }
    Ok(secret)
}

fn oauth_client(cfg: &Config, table: &ProviderTable, provider: &str) -> Result<OAuthClient> {
    let endpoints = table
        .get(provider)
        .and_then(|e| e.oauth.clone())
        .ok_or_else(|| anyhow!("provider '{provider}' has no OAuth2 endpoints"))?;
    let client_id = cfg
        .oauth
        .client_id
        .clone()
        .ok_or_else(|| anyhow!("[oauth] client_id is not set in the config"))?;
    let client_secret = match std::env::var("OAUTH_CLIENT_SECRET") {
        Ok(s) if !s.is_empty() => Some(s),
        _ => cfg.client_secret(&client_id)?,
    };
    Ok(OAuthClient::new(
        client_id,
        client_secret,
        cfg.oauth.redirect_uri.clone(),
        endpoints,
    ))
}

/// Everything a worker needs to build its own credential store.
enum Secret {
    Password(String),
    OAuth(OAuthClient, TokenFile),
}

fn secret_for(
    cfg: &Config,
    table: &ProviderTable,
    profile: &ConnectionProfile,
    conn: &ConnectionArgs,
) -> Result<Secret> {
    match profile.auth() {
        AuthKind::Password => {
            let password = match &conn.password {
                Some(p) => p.clone(),
                None => prompt_password(&conn.email)?,
            };
            Ok(Secret::Password(password))
        }
        AuthKind::OAuth2 => Ok(Secret::OAuth(
            oauth_client(cfg, table, profile.provider())?,
            TokenFile::new(cfg.token_dir()?),
        )),
    }
}

fn credential_source(secret: Secret) -> Box<dyn CredentialSource> {
    match secret {
        Secret::Password(p) => Box::new(StaticSecret::new(p)),
        Secret::OAuth(client, tokens) => Box::new(OAuthStore::new(client, tokens)),
    }
}

fn print_event(event: &ProgressEvent) {
    match event {
        ProgressEvent::Status(s) => eprintln!("{s}"),
        ProgressEvent::BatchCompleted(p) => eprintln!("{}", p.last_message),
        ProgressEvent::Warning(w) => eprintln!("warning: {w}"),
        ProgressEvent::Failed(f) => {
            eprintln!("error ({:?}): {}", f.kind, f.message);
            if let Some(pos) = f.position {
                eprintln!(
                    "  in batch {} (UIDs {}..={}); earlier batches are saved",
                    pos.batch_index, pos.first_uid, pos.last_uid
                );
            }
        }
        ProgressEvent::Finished(_) => {}
    }
}

#[allow(clippy::too_many_arguments)]
fn run_export(
    cfg: Config,
    conn: ConnectionArgs,
    folder: String,
    since: NaiveDate,
    until: NaiveDate,
    output: PathBuf,
    batch_size: Option<usize>,
    bom: bool,
) -> Result<()> {
    let table = cfg.provider_table()?;
    let profile = resolve_profile(&table, &conn)?;
    let request = FetchRequest::new(&conn.email, folder, since, until, output)
        .with_batch_size(batch_size.unwrap_or(cfg.batch_size));
    // Fail on a bad request before asking for secrets.
    request.validate()?;

    let secret = secret_for(&cfg, &table, &profile, &conn)?;
    let mut settings = cfg.engine_settings();
    settings.excel_bom |= bom;
    let decoder = MessageDecoder::new(cfg.probe_list()?);
    let connector = cfg.connector();

    let cancel = CancelToken::new();
    let c2 = cancel.clone();
    ctrlc::set_handler(move || {
        if !c2.is_cancelled() {
            eprintln!("Stopping after the current batch...");
        }
        c2.cancel();
    })?;

    let (tx, rx) = mpsc::channel::<ProgressEvent>();
    let worker = thread::spawn(move || -> Result<ExportSummary> {
        let exporter = Exporter::new(connector, credential_source(secret), profile)
            .with_settings(settings)
            .with_decoder(decoder);
        Ok(exporter.run(&request, &tx, &cancel)?)
    });

    for event in rx {
        print_event(&event);
    }

    let summary = worker
        .join()
        .map_err(|_| anyhow!("export worker panicked"))??;
    if summary.cancelled {
        println!(
            "Cancelled: {} rows from {} of {} batches saved to {}",
            summary.records_written,
            summary.batches_written,
            summary.batches_total,
            summary.output_path.display()
        );
    } else {
        println!(
            "Exported {} messages to {} ({} warnings)",
            summary.records_written,
            summary.output_path.display(),
            summary.warnings
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.cmd {
        Command::SetClientSecret { client_id } => {
            eprintln!("Paste client secret (end with Ctrl-D):");
            let mut secret = String::new();
            std::io::Read::read_to_string(&mut std::io::stdin(), &mut secret)?;
            let secret = secret.trim();
            token_store::save_client_secret(&client_id, secret)?;
            println!("Saved client secret for client_id {}", client_id);
            Ok(())
        }

        Command::InitConfig => {
            let path = write_template(config_path)?;
            println!("Wrote template config to {}", path.display());
            Ok(())
        }

        Command::Providers => {
            let cfg = load_config(config_path)?;
            let table = cfg.provider_table()?;
            for (key, entry) in table.entries() {
                println!(
                    "{key:<10} {:<18} {}:{} {:?} {:?}",
                    entry.display_name, entry.host, entry.port, entry.tls, entry.auth
                );
            }
            println!("{CUSTOM_PROVIDER:<10} (use --host/--port/--tls)");
            Ok(())
        }

        Command::Authorize { email, provider } => {
            let cfg = load_config(config_path)?;
            let table = cfg.provider_table()?;
            let store = OAuthStore::new(
                oauth_client(&cfg, &table, &provider)?,
                TokenFile::new(cfg.token_dir()?),
            );
            let token = store
                .reauthorize(&email)
                .with_context(|| format!("authorizing {email}"))?;
            println!(
                "Authorized {email}; token valid until {}",
                token.expires_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
            Ok(())
        }

        Command::Folders { conn } => {
            let cfg = load_config(config_path)?;
            let table = cfg.provider_table()?;
            let profile = resolve_profile(&table, &conn)?;
            let secret = secret_for(&cfg, &table, &profile, &conn)?;
            let exporter = Exporter::new(cfg.connector(), credential_source(secret), profile);
            for name in exporter.list_folders(&conn.email)? {
                println!("{name}");
            }
            Ok(())
        }

        Command::Export {
            conn,
            folder,
            since,
            until,
            output,
            batch_size,
            bom,
        } => {
            let cfg = load_config(config_path)?;
            run_export(cfg, conn, folder, since, until, output, batch_size, bom)
        }
    }
}
