use aurum_core::audit;
use aurum_core::form::{ActionDescriptor, RequestKind};
use aurum_core::portal::{Credentials, OperationResult, PortalConfig, Session};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "aurum", about = "AUR portal automation", version)]
struct Cli {
    /// Verbose diagnostics (-v for debug, -vv for trace), written to stderr
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Audit a PKGBUILD for dangerous shell patterns
    Audit {
        /// The PKGBUILD file to audit (use - for stdin)
        file: String,
    },
    /// Fetch the comments on a package page
    Comments {
        /// Package name
        package: String,
    },
    /// Fetch the latest news articles with full content
    News {
        /// Number of articles to fetch
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    /// Fetch package metadata from the RPC endpoint
    Info {
        /// Package name
        package: String,
    },
    /// Post a comment on a package page
    Comment {
        /// Package name
        package: String,

        /// Comment text
        message: String,

        /// Portal username (falls back to AUR_USERNAME)
        #[arg(long)]
        username: Option<String>,
    },
    /// Edit an existing comment
    EditComment {
        /// Package name
        package: String,

        /// Numeric comment id
        comment_id: u64,

        /// Replacement comment text
        message: String,

        /// Portal username (falls back to AUR_USERNAME)
        #[arg(long)]
        username: Option<String>,
    },
    /// File an orphan, deletion, or merge request
    Request {
        /// Package base name
        package: String,

        /// Request kind: orphan, deletion, or merge
        kind: RequestKind,

        /// Reason shown to the maintainers
        reason: String,

        /// Merge target package (merge requests only)
        #[arg(long)]
        merge_into: Option<String>,

        /// Portal username (falls back to AUR_USERNAME)
        #[arg(long)]
        username: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Audit { file } => {
            let text = read_input(&file);
            let findings = audit::audit(&text);
            print_json(&findings);
            if findings
                .iter()
                .any(|f| f.severity == audit::Severity::Critical)
            {
                std::process::exit(2);
            }
        }
        Commands::Comments { package } => {
            let mut session = make_session();
            match session.comments(&package) {
                Ok(comments) => print_json(&comments),
                Err(e) => fail(&e.to_string()),
            }
        }
        Commands::News { limit } => {
            let mut session = make_session();
            match session.news(limit) {
                Ok(items) => print_json(&items),
                Err(e) => fail(&e.to_string()),
            }
        }
        Commands::Info { package } => {
            let mut session = make_session();
            match session.package_info(&package) {
                Ok(info) => print_json(&info),
                Err(e) => fail(&e.to_string()),
            }
        }
        Commands::Comment {
            package,
            message,
            username,
        } => {
            let action = ActionDescriptor::add_comment(&package, &message);
            run_action(username, &action);
        }
        Commands::EditComment {
            package,
            comment_id,
            message,
            username,
        } => {
            let action = ActionDescriptor::edit_comment(&package, comment_id, &message);
            run_action(username, &action);
        }
        Commands::Request {
            package,
            kind,
            reason,
            merge_into,
            username,
        } => {
            if kind == RequestKind::Merge && merge_into.is_none() {
                fail("merge requests need --merge-into");
            }
            let action =
                ActionDescriptor::submit_request(&package, kind, &reason, merge_into.as_deref());
            run_action(username, &action);
        }
    }
}

fn make_session() -> Session {
    Session::new().unwrap_or_else(|e| fail(&e.to_string()))
}

/// Log in and perform one mutating action, printing the structured result.
/// Credentials come from flags or the environment, never from the core.
fn run_action(username: Option<String>, action: &ActionDescriptor) {
    let credentials = resolve_credentials(username);
    let mut session = Session::with_config(PortalConfig::default())
        .unwrap_or_else(|e| fail(&e.to_string()));
    let result = session.login_and_perform(&credentials, action);
    print_json(&result);
    if !result.is_success() {
        std::process::exit(1);
    }
    if let OperationResult::Success { detail } = &result {
        if detail == "unconfirmed" {
            eprintln!("note: the portal returned 2xx but no confirmation marker; verify manually");
        }
    }
}

fn resolve_credentials(username: Option<String>) -> Credentials {
    let username = username
        .or_else(|| std::env::var("AUR_USERNAME").ok())
        .unwrap_or_else(|| fail("no username given and AUR_USERNAME unset"));
    let secret =
        std::env::var("AUR_PASSWORD").unwrap_or_else(|_| fail("AUR_PASSWORD unset"));
    Credentials { username, secret }
}

fn read_input(file: &str) -> String {
    if file == "-" {
        use std::io::Read;
        let mut buf = String::new();
        if std::io::stdin().read_to_string(&mut buf).is_err() {
            fail("failed to read stdin");
        }
        buf
    } else {
        std::fs::read_to_string(file)
            .unwrap_or_else(|e| fail(&format!("failed to read {}: {}", file, e)))
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => fail(&e.to_string()),
    }
}

fn fail(msg: &str) -> ! {
    eprintln!("Error: {}", msg);
    std::process::exit(1);
}
