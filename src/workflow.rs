use crate::artifact::Subject;
use crate::cli::{InitArgs, MsccSummaryArgs, ProcessArgs, ResolveArgs};
use crate::config::{default_config, load_or_default, write_config, CONFIG_FILE_NAME};
use crate::mscc::{run_summary, MsccSummaryRequest, STATS_JSON, SUMMARY_CSV};
use crate::pipeline::{run_subject, ProcessRequest, ResolverParts, REPORT_FILE_NAME};
use crate::resolve::ResolverPaths;
use crate::util::{absolutize, display_path};
use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

fn current_dir() -> Result<PathBuf> {
    std::env::current_dir().context("read current directory")
}

fn parse_subject(raw: &str) -> Result<Subject> {
    Subject::parse(raw).map_err(|err| anyhow!(err))
}

/// Flag, then config value, then the current directory.
fn root_dir(flag: Option<&Path>, configured: Option<&Path>, cwd: &Path) -> Result<PathBuf> {
    absolutize(flag.or(configured).unwrap_or(cwd))
}

pub fn run_init(config_path: Option<&Path>, args: InitArgs) -> Result<()> {
    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
    if path.is_file() && !args.force {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            path.display()
        ));
    }
    let config = default_config(&args.profile)?;
    write_config(&path, &config)?;
    println!("wrote {}", path.display());
    Ok(())
}

pub fn run_resolve(config_path: Option<&Path>, args: ResolveArgs) -> Result<()> {
    let (config, _) = load_or_default(config_path)?;
    let naming = config.naming()?;
    let subject = parse_subject(&args.subject)?;
    let cwd = current_dir()?;
    let work_dir = root_dir(args.work_dir.as_deref(), None, &cwd)?;
    let data_dir = root_dir(args.data_dir.as_deref(), config.data_dir.as_deref(), &cwd)?;
    let output_dir = root_dir(None, config.output_dir.as_deref(), &cwd)?;
    let qc_dir = output_dir.join("qc");

    let parts = ResolverParts::build(&config, &output_dir, &qc_dir, &work_dir)?;
    let resolver = parts.resolver(
        &naming,
        ResolverPaths {
            work_dir,
            derivatives_root: naming.derivatives_root_in(&data_dir),
            qc_dir,
        },
    );

    if args.dry_run {
        let plan = resolver.plan(&args.image, args.kind, &subject)?;
        let text = serde_json::to_string_pretty(&plan).context("serialize plan")?;
        println!("{text}");
        return Ok(());
    }

    let outcome = resolver.resolve(&args.image, args.kind, &subject, &args.contrast)?;
    if args.json {
        let text = serde_json::to_string_pretty(&outcome).context("serialize outcome")?;
        println!("{text}");
    } else {
        println!(
            "{} {} ({})",
            outcome.provenance(),
            display_path(outcome.path(), Some(&cwd)),
            outcome.producer_tag()
        );
    }
    Ok(())
}

pub fn run_process(config_path: Option<&Path>, args: ProcessArgs) -> Result<()> {
    let (config, config_path) = load_or_default(config_path)?;
    let subject = parse_subject(&args.subject)?;
    let cwd = current_dir()?;
    let data_dir = root_dir(args.data_dir.as_deref(), config.data_dir.as_deref(), &cwd)?;
    let output_dir = root_dir(args.output_dir.as_deref(), config.output_dir.as_deref(), &cwd)?;
    if !data_dir.is_dir() {
        return Err(anyhow!("data dir {} does not exist", data_dir.display()));
    }
    let config_path = config_path.map(|path| absolutize(&path)).transpose()?;

    let report = run_subject(&ProcessRequest {
        config: &config,
        config_path: config_path.as_deref(),
        subject,
        data_dir,
        output_dir,
    })?;
    println!("wrote {}", report.work_dir.join(REPORT_FILE_NAME).display());
    Ok(())
}

pub fn run_mscc_summary(args: MsccSummaryArgs) -> Result<()> {
    let stats = run_summary(&MsccSummaryRequest {
        input_dir: &args.input_dir,
        participants: &args.participants,
        out_dir: &args.out,
        exclude: args.exclude.as_deref(),
    })?;
    println!("wrote {}", args.out.join(SUMMARY_CSV).display());
    println!("wrote {}", args.out.join(STATS_JSON).display());
    if stats.paired < 2 {
        eprintln!("note: fewer than two subjects with mJOA; correlations are empty");
    }
    Ok(())
}
