//! anshin CLI: care-support case database with pseudonymized identities.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use anshin::db::{CaseDb, CaseDbConfig};
use anshin::ident::SubjectId;
use anshin::resolve::MatchType;
use anshin::subject::{IdentityPatch, LegacyClient, NewSubject};

#[derive(Parser)]
#[command(name = "anshin", version, about = "Care-support case database")]
struct Cli {
    /// Data directory for persistent storage.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new anshin data directory.
    Init,

    /// Register a new subject with their identity record.
    Add {
        /// Official name.
        #[arg(long)]
        name: String,

        /// Phonetic reading (kana).
        #[arg(long)]
        reading: Option<String>,

        /// Date of birth (ISO 8601).
        #[arg(long)]
        dob: Option<String>,

        /// Blood type.
        #[arg(long)]
        blood_type: Option<String>,

        /// Alternate name or nickname. Repeatable.
        #[arg(long = "alias")]
        aliases: Vec<String>,
    },

    /// Import legacy rows from a JSON file (array of client objects).
    Import {
        /// Path to the JSON file.
        #[arg(long)]
        file: PathBuf,
    },

    /// Convert legacy rows into the pseudonymized model. Safe to re-run.
    Migrate,

    /// Resolve a free-form identifier to a subject.
    Resolve {
        /// Name, nickname, subject id, or display code.
        input: String,
    },

    /// Show one subject by an already-known identifier.
    Show {
        /// Subject id, display code, or exact official name.
        identifier: String,
    },

    /// List registered subjects.
    List {
        /// Include names and other identifying fields.
        #[arg(long)]
        include_pii: bool,
    },

    /// Update identity fields of one subject.
    Update {
        /// Subject id (`c-...`).
        subject_id: String,

        /// New official name.
        #[arg(long)]
        name: Option<String>,

        /// New phonetic reading.
        #[arg(long)]
        reading: Option<String>,

        /// New date of birth.
        #[arg(long)]
        dob: Option<String>,

        /// Alias to add. Repeatable.
        #[arg(long = "add-alias")]
        add_aliases: Vec<String>,
    },

    /// Show database statistics.
    Info,
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let data_dir = cli.data_dir.unwrap_or_else(|| PathBuf::from(".anshin"));
    let config = CaseDbConfig {
        data_dir: Some(data_dir.clone()),
        ..Default::default()
    };

    match cli.command {
        Commands::Init => {
            let db = CaseDb::new(config).into_diagnostic()?;
            println!("Initialized anshin at {}", data_dir.display());
            println!("{}", db.info().into_diagnostic()?);
        }

        Commands::Add {
            name,
            reading,
            dob,
            blood_type,
            aliases,
        } => {
            let db = CaseDb::new(config).into_diagnostic()?;
            let view = db
                .create_subject_with_identity(NewSubject {
                    name,
                    reading,
                    dob,
                    blood_type,
                    aliases,
                })
                .into_diagnostic()?;
            println!("Registered {} ({})", view.display_code, view.subject_id);
        }

        Commands::Import { file } => {
            let db = CaseDb::new(config).into_diagnostic()?;
            let content = std::fs::read_to_string(&file).into_diagnostic()?;
            let clients: Vec<LegacyClient> =
                serde_json::from_str(&content).into_diagnostic()?;

            let count = clients.len();
            for client in clients {
                db.import_legacy(client).into_diagnostic()?;
            }
            println!("Imported {count} legacy rows from {}", file.display());
            println!("Run `anshin migrate` to assign identifiers.");
        }

        Commands::Migrate => {
            let db = CaseDb::new(config).into_diagnostic()?;
            let report = db.run_migration().into_diagnostic()?;
            println!("{report}");
        }

        Commands::Resolve { input } => {
            let db = CaseDb::new(config).into_diagnostic()?;
            let resolution = db.resolve(&input).into_diagnostic()?;
            match resolution.match_type {
                MatchType::Exact | MatchType::Alias => {
                    println!("Match ({}):", resolution.match_type);
                }
                MatchType::Fuzzy => {
                    let suggested = resolution.suggested_name.as_deref().unwrap_or("?");
                    println!("Needs confirmation: did you mean \"{suggested}\"?");
                }
                MatchType::NotFound => {
                    println!("No subject matches \"{input}\".");
                }
            }
            let json = serde_json::to_string_pretty(&resolution).into_diagnostic()?;
            println!("{json}");
        }

        Commands::Show { identifier } => {
            let db = CaseDb::new(config).into_diagnostic()?;
            let clause = CaseDb::clause_for(&identifier);
            match db.lookup(&clause).into_diagnostic()? {
                Some(view) => {
                    let json = serde_json::to_string_pretty(&view).into_diagnostic()?;
                    println!("{json}");
                }
                None => miette::bail!(
                    "no subject matches {clause}; use `anshin resolve` for fuzzy input"
                ),
            }
        }

        Commands::List { include_pii } => {
            let db = CaseDb::new(config).into_diagnostic()?;
            let json = if include_pii {
                serde_json::to_string_pretty(&db.list_subjects_with_pii().into_diagnostic()?)
                    .into_diagnostic()?
            } else {
                serde_json::to_string_pretty(&db.list_subjects().into_diagnostic()?)
                    .into_diagnostic()?
            };
            println!("{json}");
        }

        Commands::Update {
            subject_id,
            name,
            reading,
            dob,
            add_aliases,
        } => {
            let db = CaseDb::new(config).into_diagnostic()?;
            let id = SubjectId::parse(&subject_id).into_diagnostic()?;
            let view = db
                .update_identity(
                    &id,
                    IdentityPatch {
                        name,
                        reading,
                        dob,
                        add_aliases,
                    },
                )
                .into_diagnostic()?;
            println!("Updated {}", view.display_code);
        }

        Commands::Info => {
            let db = CaseDb::new(config).into_diagnostic()?;
            println!("{}", db.info().into_diagnostic()?);
        }
    }

    Ok(())
}
