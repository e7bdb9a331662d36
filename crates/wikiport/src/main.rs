use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wikiport_core::archive::{SkipReason, WalkReport, WalkSettings};
use wikiport_core::config::{DEFAULT_CONFIG_FILE, ExportConfig, load_config};
use wikiport_core::entities::{RunClock, UserSpec};
use wikiport_core::export::{
    DEFAULT_GROWI_OUTPUT, DEFAULT_HTML_OUTPUT, GrowiExportOptions, HtmlExportOptions,
    run_growi_export, run_html_export,
};
use wikiport_core::html_tree::DocumentFormat;
use wikiport_core::markup::MarkupConverter;
use wikiport_core::path_codec::LegacyCodec;

#[derive(Debug, Parser)]
#[command(
    name = "wikiport",
    version,
    about = "Convert a PukiWiki dump into a Growi import bundle or a zipped document tree"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH", help = "Config file (default: ./wikiport.toml)")]
    config: Option<PathBuf>,
    #[arg(short, long, global = true, help = "Log per-entry progress")]
    verbose: bool,
    #[arg(long, global = true, help = "Print the run report as JSON")]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Write pages.json, revisions.json, users.json and meta.json into a zip")]
    Growi(GrowiArgs),
    #[command(about = "Write one rendered document per page into a zip")]
    Html(HtmlArgs),
}

#[derive(Debug, Args)]
struct GrowiArgs {
    #[arg(value_name = "DUMP_FILE", help = "PukiWiki dump (.tar or .tar.gz)")]
    dump_file: PathBuf,
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_GROWI_OUTPUT)]
    output: PathBuf,
    #[arg(short, long, value_name = "PREFIX", help = "Path prefix for every imported page")]
    prefix: Option<String>,
    #[arg(short, long, value_name = "NAME", help = "Author account name")]
    user: Option<String>,
    #[arg(short = 'g', long, value_name = "VERSION", help = "Destination server version")]
    growi_version: Option<String>,
}

#[derive(Debug, Args)]
struct HtmlArgs {
    #[arg(value_name = "DUMP_FILE", help = "PukiWiki dump (.tar or .tar.gz)")]
    dump_file: PathBuf,
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_HTML_OUTPUT)]
    output: PathBuf,
    #[arg(short, long, value_name = "PREFIX", help = "Path prefix for every exported page")]
    prefix: Option<String>,
    #[arg(long, value_enum, default_value_t = FormatArg::Html)]
    format: FormatArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Html,
    Markdown,
}

impl From<FormatArg> for DocumentFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Html => Self::Html,
            FormatArg::Markdown => Self::Markdown,
        }
    }
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let config = load_config(&config_path)?;

    match cli.command {
        Some(Commands::Growi(args)) => run_growi(&config, args, cli.json),
        Some(Commands::Html(args)) => run_html(&config, args, cli.json),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "wikiport=debug,wikiport_core=debug"
    } else {
        "wikiport=info,wikiport_core=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn walk_settings(config: &ExportConfig, prefix: Option<String>) -> Result<WalkSettings> {
    Ok(WalkSettings {
        prefix: prefix.unwrap_or_else(|| config.path_prefix()),
        codec: config.codec()?,
        converter: MarkupConverter::new(config.convert_options()),
        filter: config.page_filter(),
    })
}

fn run_growi(config: &ExportConfig, args: GrowiArgs, json: bool) -> Result<()> {
    let options = GrowiExportOptions {
        walk: walk_settings(config, args.prefix)?,
        author: UserSpec {
            name: args.user.unwrap_or_else(|| config.author_name()),
            ..UserSpec::default()
        },
        target_version: args
            .growi_version
            .unwrap_or_else(|| config.target_version()),
        ids: config.id_generator(),
        clock: RunClock::start(config.utc_offset_hours())?,
        dump: args.dump_file,
        output: args.output,
    };
    let report = run_growi_export(&options)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!("growi export");
    println!("dump: {}", normalize_path(&options.dump));
    println!("output: {}", normalize_path(&report.output));
    println!("prefix: {}", options.walk.prefix);
    print_codec(&options.walk.codec);
    println!("author: {}", report.author);
    println!("target_version: {}", report.target_version);
    println!("exported_at: {}", report.exported_at);
    println!("pages: {}", report.pages);
    println!("revisions: {}", report.revisions);
    println!("password_seed: {}", report.password_seed);
    print_walk_report("walk", &report.walk);
    println!("container.entries: {}", report.container.entries);
    println!("container.bytes: {}", report.container.uncompressed_bytes);
    Ok(())
}

fn run_html(config: &ExportConfig, args: HtmlArgs, json: bool) -> Result<()> {
    let options = HtmlExportOptions {
        walk: walk_settings(config, args.prefix)?,
        format: args.format.into(),
        dump: args.dump_file,
        output: args.output,
    };
    let report = run_html_export(&options)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!("html export");
    println!("dump: {}", normalize_path(&options.dump));
    println!("output: {}", normalize_path(&report.output));
    println!("prefix: {}", options.walk.prefix);
    print_codec(&options.walk.codec);
    println!("format: {}", report.format.as_str());
    println!("documents: {}", report.documents);
    println!("folded: {}", report.folded);
    print_walk_report("walk", &report.walk);
    println!("container.entries: {}", report.container.entries);
    println!("container.bytes: {}", report.container.uncompressed_bytes);
    Ok(())
}

fn print_codec(codec: &LegacyCodec) {
    println!("encoding: {}", codec.encoding_name());
    println!("invalid_bytes: {}", codec.invalid_bytes().as_str());
}

fn print_walk_report(prefix: &str, report: &WalkReport) {
    println!("{prefix}.total_entries: {}", report.total_entries);
    println!("{prefix}.accepted: {}", report.accepted);
    println!("{prefix}.source_bytes: {}", report.source_bytes);
    for reason in [
        SkipReason::NotRegularFile,
        SkipReason::OutsideWikiDir,
        SkipReason::SpecialPage,
    ] {
        println!(
            "{prefix}.skipped.{}: {}",
            reason_key(reason),
            report.skipped_count(reason)
        );
    }
}

fn reason_key(reason: SkipReason) -> &'static str {
    match reason {
        SkipReason::NotRegularFile => "not_regular_file",
        SkipReason::OutsideWikiDir => "outside_wiki_dir",
        SkipReason::SpecialPage => "special_page",
    }
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
