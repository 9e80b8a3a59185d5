use std::io::{Read, Write};

use anyhow::Context as _;
use dedup_index::JournalIndexStore;
use dedup_store::{
    Context, DescriptorPool, PoolError, StoreConfig, StoreError, StreamReader, StreamWriter,
};
use thiserror::Error;
use tracing::info;

use crate::cli::{Cli, Operation};

/// A problem with the invocation itself. Nothing in the store was touched.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct UsageError(pub String);

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    execute(cli, &mut std::io::stdin().lock(), &mut std::io::stdout().lock())
}

/// Validate the invocation, then run it against the store.
pub fn execute<R: Read, W: Write>(cli: Cli, input: &mut R, output: &mut W) -> anyhow::Result<()> {
    let operation = cli
        .operation()
        .ok_or_else(|| UsageError("exactly one of -r or -w is required".into()))?;
    let config = load_config(&cli)?;

    let name = match &operation {
        Operation::Read(name) | Operation::Write(name) => name.as_str(),
    };
    let manifest = config.manifest_path(name).map_err(usage)?;
    match &operation {
        Operation::Write(_) if manifest.exists() => {
            return Err(UsageError(format!("stream {name:?} already exists")).into());
        }
        Operation::Read(_) if !manifest.is_file() => {
            return Err(UsageError(format!("stream {name:?} does not exist")).into());
        }
        _ => {}
    }

    let pool = DescriptorPool::for_config(&config).map_err(|e| match e {
        e @ PoolError::LimitTooLow { .. } => anyhow::Error::from(UsageError(e.to_string())),
        other => anyhow::Error::from(other),
    })?;

    for dir in [config.segments_path(), config.manifests_path()] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create {}", dir.display()))?;
    }
    let index = JournalIndexStore::open(&config.index_path())
        .with_context(|| format!("cannot open index {}", config.index_path().display()))?;
    let mut ctx = Context::new(config, pool, index);

    let result = match operation {
        Operation::Write(name) => write_stream(&mut ctx, &name, input),
        Operation::Read(name) => read_stream(&mut ctx, &name, output),
    };
    let shutdown = ctx.shutdown();
    result?;
    shutdown?;
    Ok(())
}

fn write_stream<R: Read>(
    ctx: &mut Context<JournalIndexStore>,
    name: &str,
    input: &mut R,
) -> Result<(), StoreError> {
    let mut writer = StreamWriter::create(ctx, name)?;
    writer.write_all_from(ctx, input)?;
    let report = writer.finish(ctx)?;
    info!(
        stream = name,
        bytes = report.bytes,
        blocks = report.blocks,
        new = report.new_blocks,
        duplicate = report.duplicate_blocks,
        "stored"
    );
    Ok(())
}

fn read_stream<W: Write>(
    ctx: &mut Context<JournalIndexStore>,
    name: &str,
    output: &mut W,
) -> Result<(), StoreError> {
    let mut reader = StreamReader::open(ctx, name)?;
    let result = reader.copy_to(ctx, output);
    reader.close(&mut ctx.pool);
    let report = result?;
    info!(
        stream = name,
        bytes = report.bytes,
        blocks = report.blocks,
        filler = report.filler_blocks,
        deferrals = report.deferrals,
        "reconstructed"
    );
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<StoreConfig> {
    let mut config = match &cli.config {
        Some(path) => StoreConfig::load(path).map_err(usage)?,
        None => StoreConfig::default(),
    };
    if let Some(root) = &cli.root {
        config.root = root.clone();
    }
    config.validate().map_err(usage)?;
    Ok(config)
}

fn usage(e: StoreError) -> UsageError {
    UsageError(e.to_string())
}

/// Process exit code for a failed run.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    if err.is::<UsageError>() {
        2
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::try_parse_from;
    use std::path::Path;

    fn cli(root: &Path, args: &[&str]) -> Cli {
        let root = root.to_str().unwrap();
        let mut argv = vec!["dedup", "--root", root];
        argv.extend_from_slice(args);
        try_parse_from(argv).unwrap()
    }

    fn write(root: &Path, name: &str, data: &[u8]) -> anyhow::Result<()> {
        execute(cli(root, &["-w", name]), &mut &data[..], &mut Vec::new())
    }

    fn read(root: &Path, name: &str) -> anyhow::Result<Vec<u8>> {
        let mut out = Vec::new();
        execute(cli(root, &["-r", name]), &mut std::io::empty(), &mut out)?;
        Ok(out)
    }

    #[test]
    fn write_then_read_across_invocations() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"The quick brown fox jumps over the lazy dog";
        write(dir.path(), "fox", data).unwrap();
        write(dir.path(), "fox-again", data).unwrap();
        assert_eq!(read(dir.path(), "fox").unwrap(), data);
        assert_eq!(read(dir.path(), "fox-again").unwrap(), data);
        assert!(dir.path().join("index.journal").exists());
        assert!(dir.path().join("hashes/.sha256_16.last").exists());
    }

    #[test]
    fn existing_write_target_is_a_usage_error() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a", b"x").unwrap();
        let err = write(dir.path(), "a", b"y").unwrap_err();
        assert_eq!(exit_code(&err), 2);
    }

    #[test]
    fn missing_read_target_is_a_usage_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read(dir.path(), "nope").unwrap_err();
        assert_eq!(exit_code(&err), 2);
        assert!(!dir.path().join("index.journal").exists());
    }

    #[test]
    fn escaping_name_is_a_usage_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = write(dir.path(), "../outside", b"x").unwrap_err();
        assert_eq!(exit_code(&err), 2);
        assert!(!dir.path().join("hashes").exists());
    }

    #[test]
    fn config_file_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("dedup.toml");
        let root = dir.path().join("store");
        std::fs::write(
            &config,
            format!("root = {:?}\nmax_segment_size = 40\n", root.to_str().unwrap()),
        )
        .unwrap();
        let config = config.to_str().unwrap();
        let data: Vec<u8> = (0..64u8).collect();
        let args = try_parse_from(["dedup", "--config", config, "-w", "s"]).unwrap();
        execute(args, &mut &data[..], &mut Vec::new()).unwrap();
        assert!(root.join("hashes/sha256_16_000001").exists());

        let args = try_parse_from(["dedup", "--config", config, "-r", "s"]).unwrap();
        let mut out = Vec::new();
        execute(args, &mut std::io::empty(), &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn invalid_config_is_a_usage_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("bad.toml");
        std::fs::write(&config, "read_buffer_size = 3\n").unwrap();
        let args = try_parse_from(["dedup", "--config", config.to_str().unwrap(), "-w", "s"]).unwrap();
        let err = execute(args, &mut std::io::empty(), &mut Vec::new()).unwrap_err();
        assert_eq!(exit_code(&err), 2);
    }

    #[cfg(unix)]
    #[test]
    fn handle_limit_below_floor_is_rejected_before_store_access() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("store");
        let config = dir.path().join("dedup.toml");
        std::fs::write(
            &config,
            format!(
                "root = {:?}\nmin_handle_limit = 1000000000000\n",
                root.to_str().unwrap()
            ),
        )
        .unwrap();
        let args = try_parse_from(["dedup", "--config", config.to_str().unwrap(), "-w", "s"]).unwrap();
        let err = execute(args, &mut &b"data"[..], &mut Vec::new()).unwrap_err();

        assert_eq!(exit_code(&err), 2);
        assert_eq!(format!("{err:#}").matches("too low").count(), 1);
        assert!(!root.join("index.journal").exists());
        assert!(!root.join("hashes").exists());
    }
}
