use clap::Parser;
use mongo2pg::{Connection, SchemaMap, Syncer, SyncerConfig};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[clap(version = env!("CARGO_PKG_VERSION"), author = env!("CARGO_PKG_AUTHORS"))]
struct Opts {
    /// configuration file path.
    #[clap(short, long, default_value = "mongo2pg.toml")]
    conf: String,
    /// force a full import even when a resume position exists.
    #[clap(long)]
    reimport: bool,
    /// import only, never go into tailing mode.
    #[clap(long)]
    skip_tail: bool,
    /// tail from the newest oplog entry at or before this unix timestamp.
    #[clap(long)]
    tail_from: Option<i64>,
    /// log file path, if not specified, all log information will be output to stdout.
    #[clap(long)]
    log_path: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opts: Opts = Opts::parse();
    let collector = tracing_subscriber::fmt();
    let (non_blocking, _guard) = match &opts.log_path {
        Some(path) => {
            let path = Path::new(path);
            let dir_name = path.parent().unwrap();
            let file_name = path.file_name().unwrap().to_str().unwrap();
            let file_appender = tracing_appender::rolling::daily(dir_name, file_name);
            tracing_appender::non_blocking(file_appender)
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };
    collector.with_writer(non_blocking).init();

    let conf: SyncerConfig = toml::from_slice(&fs::read(&opts.conf)?)?;
    let mapping = SchemaMap::from_yaml(&fs::read_to_string(conf.get_schema_path())?)?;

    let mut options = conf.get_options().clone();
    options.reimport |= opts.reimport;
    options.skip_tail |= opts.skip_tail;
    if opts.tail_from.is_some() {
        options.tail_from = opts.tail_from;
    }

    let conn = Connection::from_config(&conf)?;
    conn.check_permissions()?;

    let tailer = Box::new(conn.tailer()?);
    let mut syncer = Syncer::new(
        options,
        tailer,
        Arc::new(conn.source()),
        Arc::new(conn.sink()),
        Arc::new(mapping),
    );
    info!("Begin to sync database.");
    syncer.sync()?;
    Ok(())
}
