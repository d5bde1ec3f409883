//! nvkv Tool
//!
//! Inspect and edit a store kept in a flash image file.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use nvkv::device::{FileFlash, Geometry};
use nvkv::journal::SequentialJournal;
use nvkv::{Access, Config, KeyDesc, NvkvError, Permissions, Store};
use tracing_subscriber::{fmt, EnvFilter};

type FileStore = Store<SequentialJournal<FileFlash>>;

/// nvkv flash image tool
#[derive(Parser, Debug)]
#[command(name = "nvkv")]
#[command(about = "Crash-safe key-value store on a flash image")]
#[command(version)]
struct Args {
    /// Flash image file
    #[arg(short, long, default_value = "./nvkv.img")]
    image: PathBuf,

    /// Number of journal slots used when formatting
    #[arg(long, default_value = "4")]
    slots: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a blank, formatted image
    Format {
        /// Device size in KB
        #[arg(long, default_value = "256")]
        size_kb: u64,

        /// Program unit in bytes
        #[arg(long, default_value = "8")]
        program_unit: usize,

        /// Erase unit in bytes
        #[arg(long, default_value = "4096")]
        erase_unit: usize,
    },

    /// Store a value, replacing any previous one
    Put {
        key: String,
        value: String,

        /// Let keys outside the owner's namespace read it
        #[arg(long)]
        public: bool,
    },

    /// Print a value
    Get { key: String },

    /// Delete a key
    Del { key: String },

    /// List keys matching a pattern (`*` matches any run of characters)
    Find {
        #[arg(default_value = "*")]
        query: String,
    },

    /// Show store status
    Stat,

    /// Verify arena integrity
    Check,
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();
    tracing::debug!("nvkv v{}", nvkv::VERSION);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> nvkv::Result<()> {
    let config = Config::builder().slot_count(args.slots).build();

    if let Commands::Format {
        size_kb,
        program_unit,
        erase_unit,
    } = args.command
    {
        let geometry = Geometry::new(size_kb * 1024, program_unit, erase_unit);
        let flash = FileFlash::create(&args.image, geometry).map_err(io_error)?;
        let store = Store::open_device(config, flash)?;
        store.initialize()?;
        println!("formatted {} ({} KB)", args.image.display(), size_kb);
        return Ok(());
    }

    let flash = FileFlash::open(&args.image).map_err(io_error)?;
    let store: FileStore = Store::open_device(config, flash)?;
    store.initialize()?;

    match args.command {
        Commands::Format { .. } => Ok(()),
        Commands::Put { key, value, public } => put(&store, &key, value.as_bytes(), public),
        Commands::Get { key } => get(&store, &key),
        Commands::Del { key } => del(&store, &key),
        Commands::Find { query } => find(&store, &query),
        Commands::Stat => {
            let status = store.status();
            let caps = store.capabilities();
            println!("state:        {}", status.state);
            println!("records:      {}", status.records);
            println!("arena bytes:  {}", status.arena_len);
            println!("max image:    {}", caps.max_image_size);
            println!("program unit: {}", caps.program_unit);
            Ok(())
        }
        Commands::Check => {
            store.verify_integrity()?;
            println!("ok");
            Ok(())
        }
    }
}

fn put(store: &FileStore, key: &str, value: &[u8], public: bool) -> nvkv::Result<()> {
    let permissions = if public {
        Permissions::new(Access::READ_WRITE, Access::READ)
    } else {
        Permissions::OWNER_RW
    };

    let handle = match store.create(key, value.len(), Some(&KeyDesc::new(permissions))) {
        Err(NvkvError::PreexistingKey) => store.create(key, value.len(), None)?,
        other => other?,
    };
    let written = store.write(&handle, value);
    store.close(handle)?;
    written?;

    store.flush()?;
    Ok(())
}

fn get(store: &FileStore, key: &str) -> nvkv::Result<()> {
    let handle = store.open(key, Access::READ)?;
    let mut value = vec![0u8; store.value_len(&handle)?];
    let read = store.read(&handle, &mut value);
    store.close(handle)?;
    read?;

    println!("{}", String::from_utf8_lossy(&value));
    Ok(())
}

fn del(store: &FileStore, key: &str) -> nvkv::Result<()> {
    let handle = store.open(key, Access::READ_WRITE)?;
    let deleted = store.delete(&handle);
    store.close(handle)?;
    deleted?;

    store.flush()?;
    Ok(())
}

fn find(store: &FileStore, query: &str) -> nvkv::Result<()> {
    let mut previous = None;
    loop {
        match store.find(query, previous) {
            Ok(handle) => {
                println!("{}\t{} bytes", store.key_name(&handle)?, store.value_len(&handle)?);
                previous = Some(handle);
            }
            Err(NvkvError::KeyNotFound) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

fn io_error(e: nvkv::device::DeviceError) -> NvkvError {
    NvkvError::Storage(e.into())
}
