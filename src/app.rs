use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use log::{debug, error, info};

use crate::config::{Config, Environment};
use crate::factory::{DumpfileFactory, RecordReader};
use crate::meta::mgr::Catalog;
use crate::redo::decode::decode;
use crate::ring::CommandBuffer;
use crate::signal::{self, ShutdownToken};
use crate::sink::{JsonSink, MemoryOut};
use crate::trx::store::TransactionStore;

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the replication pipeline, one reader thread per source and one
    /// writer thread per target.
    Run,

    /// Validate the configuration and print a summary.
    Check,

    /// Decode a record-dump file and print every record.
    Dump {
        /// Input record-dump file, for example redo.dump
        input: PathBuf,

        /// Dictionary snapshot used to resolve column names and types
        #[arg(short, long)]
        schema: Option<PathBuf>,

        /// Run the full pipeline and pretty-print the emitted messages
        #[arg(short, long, default_value_t = false)]
        parse: bool,

        /// Limit the total records to decode
        #[arg(short, long, default_value_t = 65535)]
        limit: usize,
    },
}

#[derive(Debug)]
pub struct App {
    pub timer: Instant,
    pub config: PathBuf,
}

impl App {
    pub fn new(config: PathBuf) -> Self {
        Self {
            timer: Instant::now(),
            config,
        }
    }

    pub fn time_costs(&self) -> Duration {
        self.timer.elapsed()
    }

    pub fn run(&mut self, command: Commands) -> Result<()> {
        debug!("{:?}, {:?}", command, self);

        match command {
            Commands::Run => self.do_run()?,
            Commands::Check => self.do_check()?,
            Commands::Dump {
                input,
                schema,
                parse,
                limit,
            } => self.do_dump(input, schema, parse, limit)?,
        }

        Ok(())
    }

    fn do_check(&self) -> Result<()> {
        let config = Config::load(&self.config)?;

        println!("Configuration:");
        println!("{:>12} => {}", "version".green(), config.version.blue());
        println!(
            "{:>12} => dumplogfile({:?}), trace({}), dumpdata({}), directread({})",
            "options".green(),
            config.dumplogfile,
            config.trace.to_string().blue(),
            config.dumpdata.to_string().blue(),
            config.directread.to_string().blue(),
        );
        for source in &config.sources {
            println!(
                "{:>12} => alias({}), name({}), server({}), tables({})",
                "source".yellow(),
                source.alias.magenta(),
                source.name.blue(),
                source.server.blue(),
                source.tables.len().to_string().cyan(),
            );
        }
        for target in &config.targets {
            println!(
                "{:>12} => alias({}), brokers({}), topic({}), source({})",
                "target".yellow(),
                target.alias.magenta(),
                target.brokers.blue(),
                target.topic.blue(),
                target.source.magenta(),
            );
        }
        Ok(())
    }

    fn do_run(&self) -> Result<()> {
        let config = Config::load(&self.config)?;
        let env = Environment::from_config(&config);
        let token = ShutdownToken::new();
        signal::install(token.clone())?;

        let mut rings: HashMap<String, Arc<CommandBuffer>> = HashMap::new();
        let mut readers = Vec::new();
        for source in &config.sources {
            let ring = Arc::new(CommandBuffer::new());
            rings.insert(source.alias.clone(), ring.clone());

            let catalog = Arc::new(match &source.schema {
                Some(path) => Catalog::from_json_file(path)?,
                None => Catalog::new(),
            });
            info!("Adding source: {}", source.name);

            let alias = source.alias.clone();
            let path = PathBuf::from(&source.server);
            let env = env.clone();
            let token = token.clone();
            readers.push(
                thread::Builder::new()
                    .name(format!("reader-{}", alias))
                    .spawn(move || {
                        if let Err(e) = run_source(path, catalog, ring.clone(), &env, &token) {
                            error!("source {}: {:#}", alias, e);
                        }
                        ring.terminate();
                    })?,
            );
        }

        let mut writers = Vec::new();
        for target in &config.targets {
            let ring = rings
                .get(&target.source)
                .cloned()
                .context("target source ring")?;
            info!("Adding target: {}", target.alias);

            let alias = target.alias.clone();
            let topic = target.topic.clone();
            writers.push(
                thread::Builder::new()
                    .name(format!("writer-{}", alias))
                    .spawn(move || run_target(ring, alias, topic))?,
            );
        }

        info!("Waiting for readers to terminate");
        for reader in readers {
            reader.join().ok();
            info!("- stopped");
        }
        info!("Waiting for writers to terminate");
        for writer in writers {
            writer.join().ok();
            info!("- stopped");
        }
        Ok(())
    }

    fn do_dump(
        &self,
        input: PathBuf,
        schema: Option<PathBuf>,
        parse: bool,
        limit: usize,
    ) -> Result<()> {
        let config = Config::load(&self.config)?;
        let env = Environment::from_config(&config);
        let catalog = Arc::new(match &schema {
            Some(path) => Catalog::from_json_file(path)?,
            None => Catalog::new(),
        });

        let mut factory = DumpfileFactory::open(input)?;
        if parse {
            let out = Arc::new(MemoryOut::new());
            let mut sink = JsonSink::new(catalog, out.clone());
            let mut store = TransactionStore::new();

            while factory.records_read() < limit {
                let Some(raw) = factory.next_record()? else {
                    break;
                };
                let rec = decode(raw, &env);
                if store.route(&env, rec) {
                    store.drain(&env, &mut sink);
                    for msg in out.take() {
                        let text = String::from_utf8_lossy(&msg).into_owned();
                        println!("{}", jsonxf::pretty_print(&text).unwrap_or(text));
                    }
                }
            }
        } else {
            while factory.records_read() < limit {
                let Some(raw) = factory.next_record()? else {
                    break;
                };
                let rec = decode(raw, &env);
                println!("{:#?}", rec);
            }
        }
        info!("decoded {} records", factory.records_read());
        Ok(())
    }
}

fn run_source(
    path: PathBuf,
    catalog: Arc<Catalog>,
    ring: Arc<CommandBuffer>,
    env: &Environment,
    token: &ShutdownToken,
) -> Result<()> {
    let mut factory = DumpfileFactory::open(path)?;
    let mut store = TransactionStore::new();
    let mut sink = JsonSink::new(catalog, ring);

    while !token.is_terminated() {
        let Some(raw) = factory.next_record()? else {
            break;
        };
        let rec = decode(raw, env);
        if store.route(env, rec) {
            store.drain(env, &mut sink);
        }
    }

    info!(
        "source done: {} records, {} transactions left open",
        factory.records_read(),
        store.open_transactions()
    );
    store.shutdown();
    Ok(())
}

fn run_target(ring: Arc<CommandBuffer>, alias: String, topic: String) {
    // broker delivery lives outside the core; the writer frames messages
    // onto the standard stream per topic
    let stdout = std::io::stdout();
    while let Some(msg) = ring.pop_message() {
        let mut out = stdout.lock();
        writeln!(out, "{}: {}", topic, String::from_utf8_lossy(&msg)).ok();
    }
    info!("target {} drained", alias);
}
