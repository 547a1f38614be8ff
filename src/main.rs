use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use clap::{Parser, Subcommand};

use tempo::error::{Error, InsertFailure};
use tempo::observer::Console;
use tempo::store::{self, Binding, Engine, SqliteStore, Store};
use tempo::{Breakpoint, DeliveryWorker, ObserverKind, Options, Payload, function_key, logging};

#[derive(Parser)]
#[command(
    name = "tempo",
    about = "Intrusive call profiling: capture call graphs and ship them as edge records",
    version
)]
struct Cli {
    /// Config file (defaults to $TEMPO_CONFIG, then ./tempo.toml).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the connection URL a database name resolves to.
    Url {
        /// Logical database name.
        database: String,
    },
    /// Create a statistics database and its table (sqlite only).
    Create {
        database: String,
    },
    /// Delete a statistics database (sqlite only).
    Drop {
        database: String,
    },
    /// Print the effective configuration as TOML.
    Config,
    /// Profile a built-in workload end to end and report what was delivered.
    Check {
        /// Database to deliver into (defaults to the configured one).
        #[arg(long)]
        database: Option<String>,

        /// Also attach the print observer.
        #[arg(long)]
        print: bool,
    },
}

fn main() {
    logging::init_tracing();
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Error> {
    let options = Options::load(cli.config.as_deref())?;
    match cli.command {
        Commands::Url { database } => {
            let binding = Binding::resolve(options.connection_url.as_deref(), &database);
            println!("{}", binding.url);
            Ok(())
        }
        Commands::Create { database } => {
            let store = sqlite_store(&options, &database)?;
            let binding = store.create_database(&database)?;
            eprintln!("created: {}", binding.url);
            Ok(())
        }
        Commands::Drop { database } => {
            let store = sqlite_store(&options, &database)?;
            if store.drop_database(&database)? {
                eprintln!("dropped: {database}");
            } else {
                eprintln!("nothing to drop: {database}");
            }
            Ok(())
        }
        Commands::Config => {
            print!("{}", options.to_toml());
            Ok(())
        }
        Commands::Check { database, print } => cmd_check(options, database, print),
    }
}

fn sqlite_store(options: &Options, database: &str) -> Result<SqliteStore, Error> {
    let base = options.connection_url.as_deref();
    let binding = Binding::resolve(base, database);
    if binding.engine != Engine::Serverless {
        return Err(Error::UnsupportedEngine { url: binding.url });
    }
    Ok(SqliteStore::new(base))
}

/// Passes payloads through to a store, counting delivered rows.
struct Counting {
    inner: Arc<dyn Store>,
    rows: AtomicU64,
    inserts: AtomicU64,
}

impl Store for Counting {
    fn resolve(&self, database_name: &str) -> Result<Binding, Error> {
        self.inner.resolve(database_name)
    }

    fn insert(&self, payload: &Payload, binding: &Binding) -> Result<(), InsertFailure> {
        self.inner.insert(payload, binding)?;
        self.rows.fetch_add(payload.len() as u64, Ordering::Relaxed);
        self.inserts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn cmd_check(mut options: Options, database: Option<String>, print: bool) -> Result<(), Error> {
    if let Some(database) = database {
        options.database_name = database;
    }
    // The check exists to profile; the kill switch does not apply to it.
    options.enable_intrusive_profiling = true;
    let asynchronous = options.enable_asynchronous_payload_delivery;

    let store = Arc::new(Counting {
        inner: store::open_store(&options)?,
        rows: AtomicU64::new(0),
        inserts: AtomicU64::new(0),
    });
    let worker = if asynchronous {
        Some(Arc::new(DeliveryWorker::spawn(options.delivery_queue_capacity)?))
    } else {
        None
    };

    let mut builder = Breakpoint::builder()
        .observer(ObserverKind::Statistics)
        .test_case_name("tempo-check")
        .options(options.clone())
        .store(store.clone())
        .console(Console::stdout());
    if let Some(worker) = &worker {
        builder = builder.delivery_worker(Arc::clone(worker));
    }
    if print {
        builder = builder.observer(ObserverKind::Print);
    }
    let checkout = builder.wrap(function_key!("checkout"), workload::checkout)?;

    let total = checkout.call(&workload::CART[..]).map_err(|failure| failure.error)?;
    if let Some(worker) = &worker {
        worker.flush();
    }

    let binding = store.resolve(&options.database_name)?;
    eprintln!(
        "checkout total {total}: {} edge records in {} insert(s) to {}",
        store.rows.load(Ordering::Relaxed),
        store.inserts.load(Ordering::Relaxed),
        binding.url
    );
    Ok(())
}

mod workload {
    use tempo::enter;

    pub const CART: [(u32, u32); 4] = [(1, 1999), (2, 450), (1, 12_000), (3, 99)];

    fn price(quantity: u32, unit: u32) -> u64 {
        let _g = enter!("price");
        u64::from(quantity) * u64::from(unit)
    }

    fn discount(subtotal: u64) -> u64 {
        let _g = enter!("discount");
        if subtotal > 10_000 { subtotal / 20 } else { 0 }
    }

    fn tax(amount: u64) -> u64 {
        let _g = enter!("tax");
        amount * 8 / 100
    }

    pub fn checkout(cart: &[(u32, u32)]) -> u64 {
        let subtotal: u64 = cart.iter().map(|&(q, u)| price(q, u)).sum();
        let net = subtotal - discount(subtotal);
        net + tax(net)
    }
}
