use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{bail, Context};
use colored::Colorize;
use serde_json::json;

use domstore_context::{Backend, ContextConfig, StorageContext};
use domstore_db::{Database, LogDatabase, LogOptions};
use domstore_types::keys::{
    parse_map_id, parse_namespace_key, parse_number, CURRENT_SCHEMA_VERSION, MAP_PREFIX, MIN_SCHEMA_VERSION,
    NAMESPACE_PREFIX, NEXT_MAP_ID_KEY, VERSION_KEY,
};
use domstore_types::{NamespaceId, Origin, PersistentNamespaceId};

use crate::cli::*;

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    let format = cli.format;
    match cli.command {
        Command::Dump(args) => cmd_dump(&config, args, format),
        Command::Usage => cmd_usage(config, format).await,
        Command::Get(args) => cmd_get(config, args, format).await,
        Command::Put(args) => cmd_put(config, args).await,
        Command::CloneNamespace(args) => cmd_clone_namespace(config, args).await,
        Command::DeleteNamespace(args) => cmd_delete_namespace(config, args).await,
        Command::Verify => cmd_verify(&config, format),
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<ContextConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?
        }
        None => ContextConfig::default(),
    };
    if let Some(dir) = &cli.dir {
        config.directory = Some(dir.clone());
    }
    Ok(config)
}

fn directory(config: &ContextConfig) -> anyhow::Result<&Path> {
    match &config.directory {
        Some(dir) => Ok(dir),
        None => bail!("no database directory; pass --dir or set `directory` in the config file"),
    }
}

/// Open the on-disk database without creating it.
fn open_existing(config: &ContextConfig) -> anyhow::Result<LogDatabase> {
    let dir = directory(config)?;
    let options = LogOptions {
        create_if_missing: false,
        ..config.log.clone()
    };
    LogDatabase::open(dir, options).with_context(|| format!("opening database in {}", dir.display()))
}

/// Start a context on the configured directory.
///
/// A storage context recreates databases it cannot read, so a damaged
/// database is reported here instead of being handed to it.
async fn open_context(config: ContextConfig) -> anyhow::Result<StorageContext> {
    let dir = directory(&config)?;
    if dir.exists() {
        let db = open_existing(&config)?;
        let problems = inspect(&db)?.problems;
        if let Some(problem) = problems.first() {
            bail!("database in {} is damaged ({problem}); run `domstore verify` for details", dir.display());
        }
    }
    Ok(StorageContext::open(config)?)
}

/// Warn if the context fell back to memory, then flush and stop it.
async fn close_context(context: StorageContext) -> anyhow::Result<()> {
    let status = context.status().await?;
    if status.connection.backend != Backend::Directory {
        eprintln!(
            "{} database could not be opened on disk; changes were not persisted",
            "warning:".yellow().bold()
        );
    }
    context.shutdown().await?;
    Ok(())
}

/// Resolve a persistent id to a live namespace, restoring it from disk.
async fn attach_namespace(context: &StorageContext, raw: &str, id: NamespaceId) -> anyhow::Result<NamespaceId> {
    let persistent_id = PersistentNamespaceId::new(raw)?;
    if persistent_id.is_local() {
        return Ok(NamespaceId::LOCAL);
    }
    context.create_namespace(id, persistent_id).await?;
    Ok(id)
}

fn render(bytes: &[u8], as_hex: bool) -> String {
    if as_hex {
        hex::encode(bytes)
    } else {
        String::from_utf8_lossy(bytes).escape_debug().to_string()
    }
}

fn cmd_dump(config: &ContextConfig, args: DumpArgs, format: OutputFormat) -> anyhow::Result<()> {
    let db = open_existing(config)?;
    let rows = db.get_prefixed(args.prefix.as_bytes())?;
    match format {
        OutputFormat::Json => {
            let rows: Vec<_> = rows
                .iter()
                .map(|(k, v)| json!({ "key": render(k, args.hex), "value": render(v, args.hex) }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        OutputFormat::Text => {
            for (key, value) in &rows {
                println!("{} = {}", render(key, args.hex).cyan(), render(value, args.hex));
            }
            println!("{}", format!("{} rows", rows.len()).dimmed());
        }
    }
    Ok(())
}

async fn cmd_usage(config: ContextConfig, format: OutputFormat) -> anyhow::Result<()> {
    let context = open_context(config).await?;
    let usage = context.storage_usage().await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&usage)?),
        OutputFormat::Text if usage.is_empty() => println!("No namespaces recorded."),
        OutputFormat::Text => {
            for info in &usage {
                println!(
                    "{}  {}  {}",
                    info.persistent_namespace_id.as_str().yellow(),
                    info.origin,
                    info.map_id.to_string().dimmed()
                );
            }
        }
    }
    close_context(context).await
}

async fn cmd_get(config: ContextConfig, args: GetArgs, format: OutputFormat) -> anyhow::Result<()> {
    let context = open_context(config).await?;
    let namespace = attach_namespace(&context, &args.area.namespace, NamespaceId::new(1)).await?;
    let area = context.open_area(namespace, Origin::new(args.area.origin)?).await?;

    let rows = match &args.key {
        Some(key) => area
            .get(key.as_bytes())
            .await?
            .map(|value| vec![(key.clone().into_bytes(), value)])
            .unwrap_or_default(),
        None => area.get_all().await?,
    };
    match format {
        OutputFormat::Json => {
            let rows: Vec<_> = rows
                .iter()
                .map(|(k, v)| json!({ "key": render(k, false), "value": render(v, false) }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        OutputFormat::Text if rows.is_empty() => {
            if let Some(key) = &args.key {
                println!("{} not set", key.bold());
            } else {
                println!("Area is empty.");
            }
        }
        OutputFormat::Text => {
            for (key, value) in &rows {
                println!("{} = {}", render(key, false).cyan(), render(value, false));
            }
        }
    }
    close_context(context).await
}

async fn cmd_put(config: ContextConfig, args: PutArgs) -> anyhow::Result<()> {
    let context = open_context(config).await?;
    let namespace = attach_namespace(&context, &args.area.namespace, NamespaceId::new(1)).await?;
    let origin = Origin::new(args.area.origin)?;
    let area = context.open_area(namespace, origin.clone()).await?;
    area.put(args.key.as_bytes(), args.value.into_bytes(), None, args.source)
        .await?;
    println!(
        "{} Set {} in {} ({})",
        "✓".green().bold(),
        args.key.bold(),
        origin,
        args.area.namespace.yellow()
    );
    close_context(context).await
}

async fn cmd_clone_namespace(config: ContextConfig, args: CloneNamespaceArgs) -> anyhow::Result<()> {
    let context = open_context(config).await?;
    let source = attach_namespace(&context, &args.source, NamespaceId::new(1)).await?;
    context
        .clone_namespace(source, NamespaceId::new(2), PersistentNamespaceId::new(args.target.as_str())?)
        .await?;
    println!(
        "{} Cloned {} into {}",
        "✓".green().bold(),
        args.source.yellow(),
        args.target.yellow()
    );
    close_context(context).await
}

async fn cmd_delete_namespace(config: ContextConfig, args: DeleteNamespaceArgs) -> anyhow::Result<()> {
    let context = open_context(config).await?;
    let namespace = attach_namespace(&context, &args.namespace, NamespaceId::new(1)).await?;
    context.delete_namespace(namespace, false).await?;
    println!("{} Deleted namespace {}", "✓".green().bold(), args.namespace.yellow());
    close_context(context).await
}

fn cmd_verify(config: &ContextConfig, format: OutputFormat) -> anyhow::Result<()> {
    let db = open_existing(config)?;
    let report = inspect(&db)?;
    let log_bytes = db.log_size()?;
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "rows": report.rows,
                "log_bytes": log_bytes,
                "schema_version": report.version,
                "namespace_records": report.records,
                "maps": report.maps,
                "next_map_id": report.next_map_id,
                "problems": report.problems,
            }))?
        ),
        OutputFormat::Text => {
            println!("  Rows: {} ({} log bytes)", report.rows.to_string().bold(), log_bytes);
            println!(
                "  Schema version: {}",
                report.version.map_or_else(|| "absent".dimmed().to_string(), |v| v.to_string())
            );
            println!("  Namespace records: {}", report.records);
            println!("  Maps with data: {}", report.maps);
            for problem in &report.problems {
                println!("  {} {}", "✗".red().bold(), problem);
            }
            if report.problems.is_empty() {
                println!("{} Database is consistent", "✓".green().bold());
            }
        }
    }
    if !report.problems.is_empty() {
        bail!("{} problem(s) found", report.problems.len());
    }
    Ok(())
}

/// Findings of a consistency check over a whole database.
#[derive(Debug, Default)]
struct Report {
    rows: usize,
    version: Option<u64>,
    records: usize,
    maps: usize,
    next_map_id: Option<u64>,
    problems: Vec<String>,
}

fn inspect(db: &dyn Database) -> anyhow::Result<Report> {
    let mut report = Report::default();
    let all = db.get_prefixed(b"")?;
    report.rows = all.len();

    match db.get(VERSION_KEY)? {
        Some(raw) => match parse_number(&raw) {
            Ok(v) if (MIN_SCHEMA_VERSION..=CURRENT_SCHEMA_VERSION).contains(&v) => report.version = Some(v),
            Ok(v) => report.problems.push(format!("unsupported schema version {v}")),
            Err(e) => report.problems.push(format!("unreadable schema version: {e}")),
        },
        None if !all.is_empty() => report.problems.push("schema version missing".into()),
        None => {}
    }

    let mut recorded = BTreeSet::new();
    for (key, value) in db.get_prefixed(NAMESPACE_PREFIX)? {
        let parsed = parse_namespace_key(&key).and_then(|_| parse_map_id(&value));
        match parsed {
            Ok(map) => {
                recorded.insert(map.get());
                report.records += 1;
            }
            Err(e) => report
                .problems
                .push(format!("bad namespace record {}: {e}", render(&key, false))),
        }
    }

    if let Some(raw) = db.get(NEXT_MAP_ID_KEY)? {
        match parse_number(&raw) {
            Ok(next) => {
                report.next_map_id = Some(next);
                if let Some(max) = recorded.iter().next_back().filter(|max| **max >= next) {
                    report
                        .problems
                        .push(format!("next-map-id {next} does not exceed recorded map {max}"));
                }
            }
            Err(e) => report.problems.push(format!("unreadable next-map-id: {e}")),
        }
    }

    let mut with_data = BTreeSet::new();
    let mut orphaned = BTreeSet::new();
    for (key, _) in db.get_prefixed(MAP_PREFIX)? {
        let id = key[MAP_PREFIX.len()..]
            .split(|b| *b == b'-')
            .next()
            .and_then(|digits| parse_number(digits).ok());
        match id {
            Some(id) if recorded.contains(&id) => {
                with_data.insert(id);
            }
            Some(id) => {
                orphaned.insert(id);
            }
            None => report.problems.push(format!("bad map row {}", render(&key, false))),
        }
    }
    report.maps = with_data.len();
    for id in orphaned {
        report.problems.push(format!("rows for unrecorded map {id}"));
    }

    for (key, _) in &all {
        let known = key.starts_with(NAMESPACE_PREFIX)
            || key.starts_with(MAP_PREFIX)
            || key == VERSION_KEY
            || key == NEXT_MAP_ID_KEY;
        if !known {
            report.problems.push(format!("unrecognized key {}", render(key, false)));
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use domstore_db::{BatchOperation, InMemoryDatabase};

    fn db(rows: &[(&str, &str)]) -> InMemoryDatabase {
        let db = InMemoryDatabase::new();
        let ops: Vec<_> = rows.iter().map(|(k, v)| BatchOperation::put(*k, *v)).collect();
        db.write(&ops).unwrap();
        db
    }

    #[test]
    fn consistent_database_has_no_problems() {
        let db = db(&[
            ("VERSION", "1"),
            ("next-map-id", "2"),
            ("namespace-a-https://x.test", "0"),
            ("namespace-b-https://x.test", "1"),
            ("map-0-k", "v"),
            ("map-1-k", "w"),
        ]);
        let report = inspect(&db).unwrap();
        assert!(report.problems.is_empty(), "{:?}", report.problems);
        assert_eq!(report.records, 2);
        assert_eq!(report.maps, 2);
        assert_eq!(report.version, Some(1));
    }

    #[test]
    fn empty_database_is_fine() {
        let report = inspect(&InMemoryDatabase::new()).unwrap();
        assert!(report.problems.is_empty());
        assert_eq!(report.version, None);
    }

    #[test]
    fn reports_every_inconsistency() {
        let db = db(&[
            ("VERSION", "7"),
            ("next-map-id", "1"),
            ("namespace-a-https://x.test", "3"),
            ("namespace-b-https://x.test", "x"),
            ("map-9-k", "v"),
            ("stray", "?"),
        ]);
        let problems = inspect(&db).unwrap().problems;
        assert_eq!(problems.len(), 5, "{problems:?}");
        assert!(problems.iter().any(|p| p.contains("schema version 7")));
        assert!(problems.iter().any(|p| p.contains("unrecorded map 9")));
        assert!(problems.iter().any(|p| p.contains("stray")));
    }

    #[test]
    fn render_escapes_or_hexes() {
        assert_eq!(render(b"a\nb", false), "a\\nb");
        assert_eq!(render(b"\x01\xff", true), "01ff");
    }

    #[test]
    fn dir_flag_overrides_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("domstore.toml");
        std::fs::write(&path, "directory = \"/from/file\"\nlow_memory = true\ncommit_error_threshold = 3\n").unwrap();

        let cli = Cli::try_parse_from(["domstore", "--config", path.to_str().unwrap(), "verify"]).unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.directory.as_deref(), Some(Path::new("/from/file")));
        assert!(config.low_memory);
        assert_eq!(config.commit_error_threshold, 3);

        let cli = Cli::try_parse_from(["domstore", "-c", path.to_str().unwrap(), "-d", "/override", "verify"]).unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.directory.as_deref(), Some(Path::new("/override")));
    }

    #[test]
    fn missing_directory_is_an_error() {
        let cli = Cli::try_parse_from(["domstore", "dump"]).unwrap();
        let config = load_config(&cli).unwrap();
        assert!(open_existing(&config).is_err());
    }

    #[tokio::test]
    async fn put_is_visible_to_the_next_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let config = ContextConfig::with_directory(dir.path().join("db"));
        let args = PutArgs {
            area: AreaArgs {
                namespace: "local".into(),
                origin: "https://x.test".into(),
            },
            key: "k".into(),
            value: "v".into(),
            source: "test".into(),
        };
        cmd_put(config.clone(), args).await.unwrap();

        let report = inspect(&open_existing(&config).unwrap()).unwrap();
        assert!(report.problems.is_empty(), "{:?}", report.problems);
        assert_eq!(report.records, 1);
        assert_eq!(report.maps, 1);

        let context = open_context(config).await.unwrap();
        let area = context
            .open_area(NamespaceId::LOCAL, Origin::new("https://x.test").unwrap())
            .await
            .unwrap();
        assert_eq!(area.get(b"k".as_slice()).await.unwrap(), Some(b"v".to_vec()));
        context.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn damaged_database_is_not_opened() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let db = LogDatabase::open(&path, LogOptions::default()).unwrap();
        db.write(&[BatchOperation::put("VERSION", "99")]).unwrap();
        drop(db);

        let err = open_context(ContextConfig::with_directory(&path)).await.unwrap_err();
        assert!(err.to_string().contains("damaged"), "{err}");
        let db = open_existing(&ContextConfig::with_directory(&path)).unwrap();
        assert_eq!(db.get(b"VERSION").unwrap(), Some(b"99".to_vec()));
    }
}
