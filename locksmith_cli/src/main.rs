use clap::{Parser, Subcommand, ValueEnum};
use locksmith_core::*;
use serde_json::json;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

const SIM_READER: &str = "Simulated Reader 0";

#[derive(Parser)]
#[command(name = "locksmith")]
#[command(about = "Setup card provisioning for MIFARE Classic lock systems", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Card reader backend
    #[arg(long, global = true, value_enum, default_value_t = BackendKind::Sim)]
    backend: BackendKind,

    /// Card file for the simulated backend (default: <data dir>/card.json)
    #[arg(long, global = true)]
    card_file: Option<PathBuf>,

    /// Reader to use (default: first reader found)
    #[arg(long, global = true)]
    reader: Option<String>,

    /// Print a JSON result envelope instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Override config file path
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    /// Simulated card persisted in a JSON file
    Sim,
    /// PC/SC reader (requires the `pcsc` feature)
    Pcsc,
}

#[derive(Subcommand)]
enum Commands {
    /// List attached readers
    Readers,

    /// Read every sector and print a hex dump
    Dump,

    /// Zero all data blocks except the manufacturer block
    Clear {
        /// Also reset sector trailers to factory keys and access bits
        #[arg(long)]
        include_trailers: bool,
    },

    /// Write the configured keys and access bits to the payload sector
    Encode {
        /// Payload block contents (32 hex digits)
        #[arg(long)]
        data: Option<String>,
    },

    /// Read back and verify the payload sector
    Decode,

    /// Put factory keys back on the payload sector
    RestoreKeys,

    /// Setup card operations
    Setup {
        #[command(subcommand)]
        command: SetupCommands,
    },

    /// Compare the lock number on a setup card with the expected one
    Check {
        #[arg(long)]
        expected: u16,
    },

    /// Show or change card settings
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Audit journal operations
    Journal {
        #[command(subcommand)]
        command: JournalCommands,
    },
}

#[derive(Subcommand)]
enum SetupCommands {
    /// Write a setup card
    Write {
        #[arg(long)]
        lock_no: u16,

        /// Wait time in seconds
        #[arg(long, default_value_t = 5)]
        wait_time: u8,

        /// Sound mode (0-3)
        #[arg(long, default_value_t = 0)]
        sound: u8,

        /// Alarm mode (0-2)
        #[arg(long, default_value_t = 0)]
        alarm: u8,

        /// Lock mode (0-3)
        #[arg(long, default_value_t = 0)]
        lock_mode: u8,

        /// Report the lock number for the next card
        #[arg(long)]
        auto_increment: bool,

        /// At the top of the lock number range, apply the configured
        /// overflow policy instead of wrapping
        #[arg(long)]
        no_wrap: bool,

        /// Write this many cards in a row, prompting between them
        #[arg(long)]
        batch: Option<u16>,
    },

    /// Zero the setup blocks
    Clear,

    /// Decode the setup blocks
    Show,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the current card settings
    Show,

    /// Change card settings; omitted values are kept
    Set {
        #[arg(long)]
        key_a: Option<String>,

        #[arg(long)]
        key_b: Option<String>,

        /// Access bits (8 hex digits)
        #[arg(long)]
        access_bits: Option<String>,

        /// Payload block (33 or 62)
        #[arg(long)]
        block: Option<u8>,
    },

    /// Restore factory card settings
    Reset,
}

#[derive(Subcommand)]
enum JournalCommands {
    /// Append the journal to a CSV file and archive it
    Export {
        /// CSV file (default: <data dir>/journal.csv)
        #[arg(long)]
        csv: Option<PathBuf>,
    },
}

/// Card actions after argument validation
enum CardAction {
    Dump,
    Clear { include_trailers: bool },
    Encode { payload: CardPayload },
    Decode,
    RestoreKeys,
    SetupWrite {
        record: SetupRecord,
        auto_increment: bool,
        wrap: bool,
        batch: u16,
    },
    SetupClear,
    SetupShow,
    Check { expected: u16 },
}

impl CardAction {
    fn name(&self) -> &'static str {
        match self {
            CardAction::Dump => "dump",
            CardAction::Clear { .. } => "clear",
            CardAction::Encode { .. } => "encode",
            CardAction::Decode => "decode",
            CardAction::RestoreKeys => "restore keys",
            CardAction::SetupWrite { .. } => "setup write",
            CardAction::SetupClear => "setup clear",
            CardAction::SetupShow => "setup show",
            CardAction::Check { .. } => "check",
        }
    }
}

struct Context {
    config: Config,
    config_path: PathBuf,
    data_dir: PathBuf,
    backend: BackendKind,
    card_file: PathBuf,
    reader: Option<String>,
}

/// Command result, printed as text or as a JSON envelope
#[derive(Default)]
struct Report {
    lines: Vec<String>,
    data: Option<serde_json::Value>,
    new_lock_no: Option<u16>,
}

impl Report {
    fn line(mut self, line: impl Into<String>) -> Self {
        self.lines.push(line.into());
        self
    }

    fn data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    fn print(self, json: bool) -> Result<()> {
        if json {
            let message = (!self.lines.is_empty()).then(|| self.lines.join("\n"));
            let envelope = Envelope::Success {
                data: self.data,
                message,
                new_lock_no: self.new_lock_no,
            };
            println!("{}", envelope.to_json()?);
        } else {
            for line in self.lines {
                println!("{}", line);
            }
        }
        Ok(())
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    locksmith_core::logging::init_with_level(level);

    let json = cli.json;
    let result = run(cli).and_then(|report| report.print(json));
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if json {
                match Envelope::error(&e).to_json() {
                    Ok(line) => println!("{}", line),
                    Err(_) => eprintln!("Error: {}", e),
                }
            } else {
                eprintln!("Error: {}", e);
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<Report> {
    let config_path = cli.config.unwrap_or_else(Config::default_config_path);
    let config = Config::load_or_default(&config_path)?;
    let data_dir = cli
        .data_dir
        .unwrap_or_else(|| config.data.data_dir.clone());
    let card_file = cli.card_file.unwrap_or_else(|| data_dir.join("card.json"));

    let ctx = Context {
        config,
        config_path,
        data_dir,
        backend: cli.backend,
        card_file,
        reader: cli.reader,
    };

    let action = match cli.command {
        Commands::Readers => return cmd_readers(&ctx),
        Commands::Config { command } => return cmd_config(&ctx, command),
        Commands::Journal { command } => return cmd_journal(&ctx, command),
        Commands::Dump => CardAction::Dump,
        Commands::Clear { include_trailers } => CardAction::Clear { include_trailers },
        Commands::Encode { data } => {
            let mut payload = CardPayload::new();
            if let Some(hex) = data {
                payload = payload.with_block(ctx.config.keys.payload_block, block_from_hex(&hex)?);
            }
            CardAction::Encode { payload }
        }
        Commands::Decode => CardAction::Decode,
        Commands::RestoreKeys => CardAction::RestoreKeys,
        Commands::Setup { command } => match command {
            SetupCommands::Write {
                lock_no,
                wait_time,
                sound,
                alarm,
                lock_mode,
                auto_increment,
                no_wrap,
                batch,
            } => {
                let record = SetupRecord {
                    lock_number: lock_no,
                    wait_time,
                    sound_mode: sound,
                    alarm_mode: alarm,
                    lock_mode,
                };
                record.validate()?;
                CardAction::SetupWrite {
                    record,
                    auto_increment,
                    wrap: !no_wrap,
                    batch: batch.unwrap_or(1).max(1),
                }
            }
            SetupCommands::Clear => CardAction::SetupClear,
            SetupCommands::Show => CardAction::SetupShow,
        },
        Commands::Check { expected } => CardAction::Check { expected },
    };

    run_card_action(&ctx, &action)
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

fn run_card_action(ctx: &Context, action: &CardAction) -> Result<Report> {
    let mut settings = ctx.config.engine_settings()?;
    if let CardAction::SetupWrite { wrap, .. } = action {
        settings.wrap_lock_numbers = *wrap;
    }
    let engine = ProvisioningEngine::new(settings)?;

    match ctx.backend {
        BackendKind::Sim => {
            let card = SimulatedCard::load_or_new(&ctx.card_file, SIM_READER)?;
            let reader = ctx
                .reader
                .as_deref()
                .map(ReaderId::new)
                .unwrap_or_else(|| card.reader().clone());
            let handle = TransportHandle::new(card, reader);
            let result = execute(ctx, &engine, &handle, action);
            // Partial writes are real, so the card is saved either way
            handle.into_inner().save(&ctx.card_file)?;
            result
        }
        BackendKind::Pcsc => run_pcsc(ctx, &engine, action),
    }
}

#[cfg(feature = "pcsc")]
fn run_pcsc(ctx: &Context, engine: &ProvisioningEngine, action: &CardAction) -> Result<Report> {
    let transport = PcscTransport::new()?;
    let reader = match &ctx.reader {
        Some(name) => ReaderId::new(name.as_str()),
        None => transport
            .list_readers()?
            .into_iter()
            .next()
            .ok_or(TransportError::NoReaders)?,
    };
    let handle = TransportHandle::new(transport, reader);
    execute(ctx, engine, &handle, action)
}

#[cfg(not(feature = "pcsc"))]
fn run_pcsc(_ctx: &Context, _engine: &ProvisioningEngine, _action: &CardAction) -> Result<Report> {
    pcsc_unavailable()
}

fn cmd_readers(ctx: &Context) -> Result<Report> {
    let readers = match ctx.backend {
        BackendKind::Sim => {
            let card = SimulatedCard::load_or_new(&ctx.card_file, SIM_READER)?;
            card.list_readers()?
        }
        BackendKind::Pcsc => list_pcsc_readers()?,
    };

    let names: Vec<&str> = readers.iter().map(ReaderId::as_str).collect();
    let mut report = Report::default().data(json!({ "readers": names }));
    if names.is_empty() {
        report = report.line("No readers found.");
    }
    for name in &names {
        report = report.line(*name);
    }
    Ok(report)
}

#[cfg(feature = "pcsc")]
fn list_pcsc_readers() -> Result<Vec<ReaderId>> {
    Ok(PcscTransport::new()?.list_readers()?)
}

#[cfg(not(feature = "pcsc"))]
fn list_pcsc_readers() -> Result<Vec<ReaderId>> {
    pcsc_unavailable()
}

#[cfg(not(feature = "pcsc"))]
fn pcsc_unavailable<T>() -> Result<T> {
    Err(Error::Config(
        "this build has no PC/SC support; rebuild with --features pcsc".into(),
    ))
}

// ---------------------------------------------------------------------------
// Card actions
// ---------------------------------------------------------------------------

/// Journal for card actions on one reader. Journal failures never fail the
/// card action itself.
struct Journal {
    sink: JournalSink,
    reader: String,
}

impl Journal {
    fn record(
        &mut self,
        action: &str,
        lock_number: Option<u16>,
        outcome: Outcome,
        detail: Option<String>,
    ) {
        let mut event = ProvisioningEvent::new(self.reader.as_str(), action, outcome);
        event.lock_number = lock_number;
        event.detail = detail;
        if let Err(e) = self.sink.append(&event) {
            tracing::warn!("Could not journal {}: {}", action, e);
        }
    }

    fn track<R>(
        &mut self,
        action: &str,
        lock_number: Option<u16>,
        result: std::result::Result<R, OpError>,
    ) -> Result<R> {
        match &result {
            Ok(_) => self.record(action, lock_number, Outcome::Success, None),
            Err(e) => self.record(action, lock_number, Outcome::Failed, Some(e.to_string())),
        }
        Ok(result?)
    }
}

fn execute<T: CardTransport>(
    ctx: &Context,
    engine: &ProvisioningEngine,
    handle: &TransportHandle<T>,
    action: &CardAction,
) -> Result<Report> {
    let mut journal = Journal {
        sink: JournalSink::new(ctx.journal_path()),
        reader: handle.reader().to_string(),
    };
    let name = action.name();

    let report = match action {
        CardAction::Dump => {
            let dump = journal.track(name, None, engine.dump(handle))?;
            let mut report = Report::default().data(json!({
                "unreadable_sectors": dump.unreadable_sectors,
                "dump": dump.text,
            }));
            report = report.line(dump.text.trim_end());
            if !dump.unreadable_sectors.is_empty() {
                let list: Vec<String> =
                    dump.unreadable_sectors.iter().map(u8::to_string).collect();
                report = report.line(format!("Unreadable sectors: {}", list.join(", ")));
            }
            report
        }

        CardAction::Clear { include_trailers } => {
            let cleared =
                journal.track(name, None, engine.clear_all_blocks(handle, *include_trailers))?;
            let mut report = Report::default()
                .data(serde_json::to_value(&cleared)?)
                .line(format!("✓ Cleared {} blocks", cleared.cleared.len()));
            for (block, reason) in &cleared.skipped {
                report = report.line(format!("  Skipped block {}: {}", block, reason));
            }
            report
        }

        CardAction::Encode { payload } => {
            let encoded = journal.track(name, None, engine.encode(handle, payload))?;
            let blocks: Vec<String> = encoded.blocks_written.iter().map(u8::to_string).collect();
            let report = Report::default()
                .data(serde_json::to_value(&encoded)?)
                .line(format!(
                    "✓ Sector {} encoded (blocks {})",
                    encoded.sector,
                    blocks.join(", ")
                ));
            if encoded.key_verified {
                report.line("  New key A verified")
            } else {
                report.line("  Warning: new key A did not authenticate")
            }
        }

        CardAction::Decode => {
            let decoded = journal.track(name, None, engine.decode(handle))?;
            let blocks: serde_json::Map<String, serde_json::Value> = decoded
                .blocks
                .iter()
                .map(|(b, data)| (b.to_string(), json!(hex_spaced(data))))
                .collect();
            let mut report = Report::default()
                .data(json!({
                    "sector": decoded.sector,
                    "access_bits": decoded.access_bits,
                    "blocks": blocks,
                    "last_lock": decoded.last_lock,
                }))
                .line(format!("Sector {}: {}", decoded.sector, decoded.access_bits));
            for (block, data) in &decoded.blocks {
                report = report.line(format!("[B{:02}] {}", block, hex_spaced(data)));
            }
            match decoded.last_lock {
                Some(lock) => report.line(format!("Last closed lock: {}", lock)),
                None => report.line("Last closed lock: none"),
            }
        }

        CardAction::RestoreKeys => {
            let restored = journal.track(name, None, engine.restore_factory_keys(handle))?;
            Report::default()
                .data(serde_json::to_value(&restored)?)
                .line(format!("✓ Factory keys restored on sector {}", restored.sector))
        }

        CardAction::SetupWrite {
            record,
            auto_increment,
            batch,
            ..
        } => write_setup_batch(engine, handle, &mut journal, *record, *auto_increment, *batch)?,

        CardAction::SetupClear => {
            journal.track(name, None, engine.clear_setup_blocks(handle))?;
            Report::default().line("✓ Setup blocks cleared")
        }

        CardAction::SetupShow => {
            let state = journal.track(name, None, engine.read_setup(handle))?;
            let report = Report::default().data(serde_json::to_value(state)?);
            match state {
                SetupState::Unprovisioned => report.line("Card holds no setup data"),
                SetupState::Provisioned(r) => report.line(format!(
                    "Setup card for lock {} (wait {}s, sound {}, alarm {}, lock mode {})",
                    r.lock_number, r.wait_time, r.sound_mode, r.alarm_mode, r.lock_mode
                )),
            }
        }

        CardAction::Check { expected } => {
            let result = engine.check_lock_number(handle, *expected);
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    journal.record(name, Some(*expected), Outcome::Failed, Some(e.to_string()));
                    return Err(e.into());
                }
            };

            let report = Report::default().data(serde_json::to_value(outcome)?);
            match outcome {
                CheckOutcome::Match { lock_number } => {
                    journal.record(name, Some(lock_number), Outcome::Success, None);
                    report.line(format!("✓ Lock number matches: {}", lock_number))
                }
                CheckOutcome::Mismatch { expected, found } => {
                    journal.record(
                        name,
                        Some(found),
                        Outcome::Mismatch,
                        Some(format!("expected {}", expected)),
                    );
                    report.line(format!(
                        "✗ Lock number mismatch: expected {}, found {}",
                        expected, found
                    ))
                }
                CheckOutcome::Unprovisioned => {
                    journal.record(name, None, Outcome::Mismatch, Some("unprovisioned".into()));
                    report.line("Card holds no setup data")
                }
            }
        }
    };

    Ok(report)
}

fn write_setup_batch<T: CardTransport>(
    engine: &ProvisioningEngine,
    handle: &TransportHandle<T>,
    journal: &mut Journal,
    first: SetupRecord,
    auto_increment: bool,
    batch: u16,
) -> Result<Report> {
    let auto_increment = auto_increment || batch > 1;
    let mut record = first;
    let mut written = Vec::with_capacity(batch as usize);
    let mut report = Report::default();

    for i in 0..batch {
        if i > 0 {
            prompt_next_card(record.lock_number)?;
        }
        let outcome = journal.track(
            "setup write",
            Some(record.lock_number),
            engine.write_setup_card(handle, &record, auto_increment),
        )?;
        written.push(record.lock_number);
        report = report.line(format!("✓ Setup card written for lock {}", record.lock_number));

        report.new_lock_no = outcome.new_lock_no;
        if let Some(next) = outcome.new_lock_no {
            record.lock_number = next;
        }
    }

    if let Some(next) = report.new_lock_no {
        report = report.line(format!("  Next lock number: {}", next));
    }
    Ok(report.data(json!({ "written": written, "record": first })))
}

fn prompt_next_card(lock_number: u16) -> Result<()> {
    eprint!("Place the card for lock {} and press Enter ", lock_number);
    io::stderr().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings and journal
// ---------------------------------------------------------------------------

impl Context {
    fn journal_path(&self) -> PathBuf {
        self.data_dir.join("journal.jsonl")
    }
}

fn settings_report(settings: &Settings, path: &Path) -> Result<Report> {
    Ok(Report::default()
        .data(serde_json::to_value(settings)?)
        .line(format!("Key A:         {}", settings.key_a.to_hex()))
        .line(format!("Key B:         {}", settings.key_b.to_hex()))
        .line(format!("Access bits:   {}", settings.access_bits.to_hex()))
        .line(format!("Payload block: {}", settings.payload_block))
        .line(format!("Config file:   {}", path.display())))
}

fn cmd_config(ctx: &Context, command: ConfigCommands) -> Result<Report> {
    let mut store = FileConfigStore::new(&ctx.config_path);

    match command {
        ConfigCommands::Show => settings_report(&store.get_defaults()?, store.path()),
        ConfigCommands::Set {
            key_a,
            key_b,
            access_bits,
            block,
        } => {
            let current = store.get_defaults()?;
            let settings = Settings::from_hex(
                &key_a.unwrap_or_else(|| current.key_a.to_hex()),
                &key_b.unwrap_or_else(|| current.key_b.to_hex()),
                &access_bits.unwrap_or_else(|| current.access_bits.to_hex()),
                block.unwrap_or(current.payload_block),
            )?;
            store.save(&settings)?;
            let mut report = settings_report(&settings, store.path())?;
            report.lines.insert(0, "✓ Settings saved".into());
            Ok(report)
        }
        ConfigCommands::Reset => {
            let settings = store.reset_to_factory()?;
            let mut report = settings_report(&settings, store.path())?;
            report.lines.insert(0, "✓ Settings reset to factory defaults".into());
            Ok(report)
        }
    }
}

fn cmd_journal(ctx: &Context, command: JournalCommands) -> Result<Report> {
    match command {
        JournalCommands::Export { csv } => {
            let journal_path = ctx.journal_path();
            let csv_path = csv.unwrap_or_else(|| ctx.data_dir.join("journal.csv"));
            if !journal_path.exists() {
                return Ok(Report::default()
                    .data(json!({ "exported": 0 }))
                    .line("No journal found - nothing to export."));
            }

            let count = journal::export_to_csv_and_archive(&journal_path, &csv_path)?;
            Ok(Report::default()
                .data(json!({ "exported": count, "csv": csv_path }))
                .line(format!("✓ Exported {} events to CSV", count))
                .line(format!("  CSV: {}", csv_path.display())))
        }
    }
}
