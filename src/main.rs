use std::{process::ExitCode, sync::Arc};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ledgerstore::{
    config::{CliArgs, Command, Config, LoggingConfig},
    report, Store,
};
use ledgerstore_core::{BalancesQuery, Context, StorageError};

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    let _ = if logging.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

fn execute(command: &Command, store: &Store, ctx: &Context) -> Result<(), StorageError> {
    store.initialize(ctx)?;
    match command {
        Command::Migrate { ledger } => {
            tracing::info!(ledger = %ledger, "ledger schema is up to date");
        }
        Command::Volumes { address, .. } => {
            let volumes = store.get_account_volumes(ctx, address)?;
            println!("{}", report::volumes_table(address, &volumes));
        }
        Command::Balances {
            address,
            offset,
            page_size,
            ..
        } => {
            let page = store.get_aggregated_balances(
                ctx,
                &BalancesQuery {
                    address: address.clone(),
                    offset: *offset,
                    page_size: *page_size,
                },
            )?;
            println!("{}", report::balances_table(&page));
            if let Some(next) = page.next {
                println!("next: {}", next);
            }
        }
    }
    Ok(())
}

fn run(cli: &CliArgs, config: &Config) -> Result<(), StorageError> {
    let registry = Arc::new(config.registry()?);
    let driver = config.driver(registry)?;
    let ctx = config.storage.context();

    let ledger = match &cli.command {
        Command::Migrate { ledger } | Command::Volumes { ledger, .. } | Command::Balances { ledger, .. } => ledger,
    };

    driver.initialize(&ctx)?;
    let store = driver.new_store(&ctx, ledger)?;
    let result = execute(&cli.command, &store, &ctx);

    store.close(&ctx)?;
    driver.close(&ctx)?;
    result
}

fn main() -> ExitCode {
    let cli = CliArgs::parse();
    let config = Config::load(&cli);
    init_tracing(&config.logging);

    match run(&cli, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
