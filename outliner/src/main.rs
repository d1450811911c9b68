use std::{
    collections::{BTreeSet, HashSet},
    fs,
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use outliner::config::Settings;
use outliner::core::{BlockId, OutlinerFile, TaskState};
use outliner::edit::{self, EditCommand, EditContext, PasteMode};
use outliner::parser::NomOutlineParser;
use outliner::persist::{FlushOutcome, PersistenceScheduler};
use outliner::storage::{DocumentStore, FsStore, OutlineParser};
use outliner::{ViewController, anchor_index, format_outline_with};
use tracing_subscriber::EnvFilter;

/// File extensions treated as outline documents when scanning directories.
const OUTLINE_EXTENSIONS: &[&str] = &["md", "markdown", "txt"];

#[derive(Debug, Parser)]
#[command(
    name = "outliner",
    about = "Block outliner tooling for plain-text list documents",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// JSON settings file; defaults apply to anything it leaves out.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse outline files and print their block trees.
    Parse(ParseArgs),

    /// Rewrite outline files in canonical form.
    Format(FormatArgs),

    /// Validate structure and report parse warnings.
    Check(CheckArgs),

    /// Apply one edit command to a file and save it.
    Edit(EditArgs),

    /// Print the rows a view would show, after zooming and collapsing.
    View(ViewArgs),

    /// Print the line range of every block anchor.
    Anchors(AnchorsArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Outline files or directories containing them.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of an indented tree.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct FormatArgs {
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

#[derive(Debug, Args)]
struct CheckArgs {
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Operation {
    SetText,
    Split,
    MergeForward,
    MergeBackward,
    Indent,
    Outdent,
    InsertAfter,
    Delete,
    RemoveSubtree,
    Paste,
    ToggleTask,
    ToggleStatus,
    Move,
    MoveUp,
    MoveDown,
}

#[derive(Debug, Args)]
struct EditArgs {
    file: PathBuf,
    #[arg(value_enum)]
    operation: Operation,
    /// Anchor id of the block the operation applies to.
    #[arg(long)]
    block: String,
    /// Text for set-text and paste.
    #[arg(long)]
    text: Option<String>,
    /// Character offset for split and paste; defaults to the end of the text.
    #[arg(long)]
    offset: Option<usize>,
    /// New parent for move; omit to move to the top level.
    #[arg(long)]
    parent: Option<String>,
    /// Position among the new parent's children for move.
    #[arg(long, default_value_t = 0)]
    index: usize,
    /// Paste everything into the block instead of splitting on newlines.
    #[arg(long)]
    literal: bool,
    /// Restrict the edit to this block's subtree.
    #[arg(long)]
    scope: Option<String>,
    /// Print the result instead of writing it.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct ViewArgs {
    file: PathBuf,
    /// Zoom into these blocks, outermost first.
    #[arg(long)]
    zoom: Vec<String>,
    /// Collapse these blocks.
    #[arg(long)]
    collapse: Vec<String>,
}

#[derive(Debug, Args)]
struct AnchorsArgs {
    file: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let settings = match &cli.settings {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    match cli.command {
        Commands::Parse(args) => handle_parse(args),
        Commands::Format(args) => handle_format(args, &settings),
        Commands::Check(args) => handle_check(args),
        Commands::Edit(args) => handle_edit(args, &settings),
        Commands::View(args) => handle_view(args, &settings),
        Commands::Anchors(args) => handle_anchors(args, &settings),
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_all(inputs: &[PathBuf]) -> Result<Vec<(PathBuf, OutlinerFile)>> {
    let expanded = expand_inputs(inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no outline files found in the provided inputs");
    }
    let parser = NomOutlineParser;
    let mut parsed = Vec::new();
    for path in expanded {
        tracing::debug!(?path, "parsing");
        let file = parser
            .parse_file(&path)
            .with_context(|| format!("parsing {:?}", path))?;
        parsed.push((path, file));
    }
    Ok(parsed)
}

fn handle_parse(args: ParseArgs) -> Result<()> {
    let ParseArgs { inputs, json } = args;
    let parsed = parse_all(&inputs)?;

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            path: String,
            outline: &'a OutlinerFile,
        }

        let payload: Vec<JsonOutput<'_>> = parsed
            .iter()
            .map(|(path, file)| JsonOutput {
                path: path.display().to_string(),
                outline: file,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (idx, (path, file)) in parsed.iter().enumerate() {
            if parsed.len() > 1 {
                println!("== {} ==", path.display());
            }
            print!("{}", render_tree(file));
            if parsed.len() > 1 && idx + 1 < parsed.len() {
                println!();
            }
        }
    }
    Ok(())
}

/// One line per block: indentation, anchor, first line of text.
fn render_tree(file: &OutlinerFile) -> String {
    let mut out = String::new();
    for id in file.preorder() {
        let Some(block) = file.block(&id) else {
            continue;
        };
        let depth = file.depth(&id);
        out.push_str(&format!(
            "{}^{} {}\n",
            "  ".repeat(depth),
            id,
            block.first_line()
        ));
    }
    out
}

fn handle_format(args: FormatArgs, settings: &Settings) -> Result<()> {
    let FormatArgs { inputs, in_place } = args;
    let parsed = parse_all(&inputs)?;
    let options = settings.format_options();
    let mut first = true;

    for (path, file) in parsed {
        let formatted = format_outline_with(&file, &options);
        if in_place {
            FsStore::new(&path).write(&formatted)?;
        } else {
            if !first {
                println!();
                println!("== {} ==", path.display());
            } else if inputs.len() > 1 {
                println!("== {} ==", path.display());
            }
            first = false;
            print!("{formatted}");
        }
    }
    Ok(())
}

fn handle_check(args: CheckArgs) -> Result<()> {
    let parsed = parse_all(&args.inputs)?;
    let mut failures = 0;
    for (path, file) in &parsed {
        let warnings = file.warnings();
        match file.validate() {
            Ok(()) => println!(
                "{}: {} blocks, {} warnings",
                path.display(),
                file.len(),
                warnings.len()
            ),
            Err(err) => {
                failures += 1;
                println!("{}: invalid: {err}", path.display());
            }
        }
        for (id, warning) in warnings {
            println!("  ^{id}: {}", warning.message());
        }
    }
    if failures > 0 {
        anyhow::bail!("{failures} file(s) failed validation");
    }
    Ok(())
}

fn edit_command(args: &EditArgs, file: &OutlinerFile) -> Result<EditCommand> {
    let block = BlockId::from(args.block.as_str());
    let current = file
        .block(&block)
        .with_context(|| format!("no block ^{} in {:?}", args.block, args.file))?;
    let offset = args.offset.unwrap_or_else(|| current.char_len());
    let text = || {
        args.text
            .clone()
            .with_context(|| format!("{:?} needs --text", args.operation))
    };
    let command = match args.operation {
        Operation::SetText => EditCommand::SetText {
            block,
            text: text()?,
        },
        Operation::Split => EditCommand::Split { block, offset },
        Operation::MergeForward => EditCommand::MergeForward { block },
        Operation::MergeBackward => EditCommand::MergeBackward { block },
        Operation::Indent => EditCommand::Indent { block },
        Operation::Outdent => EditCommand::Outdent { block },
        Operation::InsertAfter => EditCommand::InsertAfter { block },
        Operation::Delete => EditCommand::Delete { block },
        Operation::RemoveSubtree => EditCommand::RemoveSubtree { block },
        Operation::Paste => EditCommand::Paste {
            block,
            offset,
            text: text()?,
            mode: if args.literal {
                PasteMode::Literal
            } else {
                PasteMode::Split
            },
        },
        Operation::ToggleTask => EditCommand::ToggleTaskMarker { block },
        Operation::ToggleStatus => EditCommand::ToggleTaskStatus { block },
        Operation::Move => EditCommand::ReparentMove {
            block,
            parent: args.parent.as_deref().map(BlockId::from),
            index: args.index,
        },
        Operation::MoveUp => EditCommand::MoveUp { block },
        Operation::MoveDown => EditCommand::MoveDown { block },
    };
    Ok(command)
}

fn handle_edit(args: EditArgs, settings: &Settings) -> Result<()> {
    let store = FsStore::new(&args.file);
    let file = outliner::parse_outline(&store.read()?);
    let command = edit_command(&args, &file)?;
    let scope = args.scope.as_deref().map(BlockId::from);
    let ctx = EditContext::new(scope.as_ref(), Utc::now());

    let Some(outcome) = edit::apply(&file, &command, ctx) else {
        eprintln!("nothing to do");
        return Ok(());
    };
    if args.dry_run {
        print!("{}", format_outline_with(&outcome.file, &settings.format_options()));
        return Ok(());
    }

    let now = Instant::now();
    let mut scheduler = PersistenceScheduler::new(settings);
    scheduler.attach(&store)?;
    let changed = outcome.dirty.len();
    scheduler.mark_dirty(outcome.dirty, now);
    match scheduler.flush_now(now, &outcome.file, &store) {
        FlushOutcome::Failed(err) => anyhow::bail!("saving {:?}: {err}", args.file),
        _ => {
            println!("{}: {changed} block(s) changed", args.file.display());
            Ok(())
        }
    }
}

fn handle_view(args: ViewArgs, settings: &Settings) -> Result<()> {
    let store = FsStore::new(&args.file);
    let mut view = ViewController::open(&store, settings.clone())?;
    let now = Instant::now();
    for id in &args.collapse {
        let id = BlockId::from(id.as_str());
        if !view.toggle_collapse(&id, now) {
            anyhow::bail!("cannot collapse ^{id}");
        }
    }
    for id in &args.zoom {
        let id = BlockId::from(id.as_str());
        if !view.zoom_in(&id, now) {
            anyhow::bail!("cannot zoom into ^{id}");
        }
    }

    let crumbs: Vec<String> = view.breadcrumbs().into_iter().map(|c| c.label).collect();
    println!("{}", crumbs.join(" > "));
    for row in view.rows() {
        let bullet = match (row.has_children, row.collapsed) {
            (true, true) => "+",
            (true, false) => "-",
            (false, _) => "*",
        };
        let task = match row.task {
            TaskState::Todo => "[ ] ",
            TaskState::Done => "[x] ",
            TaskState::None => "",
        };
        let flag = if row.warning { " (!)" } else { "" };
        let first = row.display.lines().next().unwrap_or("");
        let text = first
            .strip_prefix("[ ] ")
            .or_else(|| first.strip_prefix("[x] "))
            .or_else(|| first.strip_prefix("[X] "))
            .unwrap_or(first);
        println!("{}{bullet} {task}{text}{flag}", "  ".repeat(row.depth));
    }
    for banner in view.warnings() {
        eprintln!("warning: ^{}: {}", banner.block, banner.message);
    }
    Ok(())
}

fn handle_anchors(args: AnchorsArgs, settings: &Settings) -> Result<()> {
    let file = NomOutlineParser.parse_file(&args.file)?;
    for (id, lines) in anchor_index(&file, &settings.format_options()) {
        println!("{id}\t{}..{}", lines.start, lines.end);
    }
    Ok(())
}

fn is_outline_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| OUTLINE_EXTENSIONS.contains(&ext))
}

fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = BTreeSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            tracing::debug!(dir = ?canonical, "scanning directory");
            let mut found = Vec::new();
            visit_dir(&canonical, &mut found, &mut HashSet::new())?;
            found.sort();
            for file in found {
                if visited.insert(file.clone()) {
                    out.push(file);
                }
            }
        } else if meta.is_file() {
            if !is_outline_file(&canonical) {
                anyhow::bail!("{:?} is not an outline file", canonical);
            }
            if visited.insert(canonical.clone()) {
                out.push(canonical);
            }
        }
    }
    Ok(out)
}

fn visit_dir(path: &Path, out: &mut Vec<PathBuf>, visited: &mut HashSet<PathBuf>) -> Result<()> {
    let canonical = fs::canonicalize(path)?;
    if !visited.insert(canonical.clone()) {
        return Ok(());
    }

    let metadata = fs::metadata(&canonical)?;
    if metadata.is_dir() {
        for entry in fs::read_dir(&canonical)? {
            let entry = entry?;
            if entry.file_type()?.is_symlink() {
                continue;
            }
            visit_dir(&entry.path(), out, visited)?;
        }
    } else if metadata.is_file() && is_outline_file(&canonical) {
        tracing::debug!(path = ?canonical, "found outline file");
        out.push(canonical);
    }
    Ok(())
}
