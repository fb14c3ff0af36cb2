use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use org_edit::core::{Document, EditHost, EditorConfig, KeywordSet, Position, UuidGenerator};
use org_edit::document::TextDocument;
use org_edit::engine::{Command, Outcome, StructuralEditor};
use org_edit::link::{self, Link};
use org_edit::{analyze_context, heading, property};
use tracing::debug;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(
    name = "org-edit",
    about = "Structural editing for Org outline files",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// JSON file with editor settings.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Keyword sequence such as "TODO NEXT | DONE"; beats the file's #+TODO line.
    #[arg(long, global = true)]
    keywords: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Classify the structural element under a cursor.
    Context(ContextArgs),

    /// Print the line span of the subtree enclosing a line.
    Subtree(SubtreeArgs),

    /// Run one structural edit at a cursor.
    Edit(EditArgs),

    /// List the links in a file.
    Links(LinksArgs),

    /// Read or write heading properties.
    Property(PropertyArgs),
}

/// Cursor coordinates are 1-based, as editors show them.
#[derive(Debug, Args)]
struct CursorArgs {
    file: PathBuf,
    #[arg(long)]
    line: usize,
    #[arg(long)]
    column: usize,
}

#[derive(Debug, Args)]
struct ContextArgs {
    #[command(flatten)]
    cursor: CursorArgs,
    /// Emit JSON instead of a one-line summary.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct SubtreeArgs {
    file: PathBuf,
    #[arg(long)]
    line: usize,
}

#[derive(Debug, Args)]
struct EditArgs {
    #[command(flatten)]
    cursor: CursorArgs,
    #[arg(value_enum)]
    action: EditAction,
    /// Overwrite the file instead of printing the result to stdout.
    #[arg(long)]
    in_place: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum EditAction {
    /// New sibling after the element and its nested content.
    InsertSibling,
    /// New sibling directly below the current line.
    InsertSiblingImmediate,
    Split,
    Promote,
    Demote,
    FoldOrIndent,
    NextCell,
    PreviousCell,
    CycleKeyword,
    ToggleCheckbox,
    Renumber,
}

impl EditAction {
    fn command(self) -> Command {
        match self {
            EditAction::InsertSibling => Command::InsertSibling {
                respect_content: true,
            },
            EditAction::InsertSiblingImmediate => Command::InsertSibling {
                respect_content: false,
            },
            EditAction::Split => Command::Split,
            EditAction::Promote => Command::Promote,
            EditAction::Demote => Command::Demote,
            EditAction::FoldOrIndent => Command::FoldOrIndent,
            EditAction::NextCell => Command::NextCell,
            EditAction::PreviousCell => Command::PreviousCell,
            EditAction::CycleKeyword => Command::CycleKeyword,
            EditAction::ToggleCheckbox => Command::ToggleCheckbox,
            EditAction::Renumber => Command::Renumber,
        }
    }
}

#[derive(Debug, Args)]
struct LinksArgs {
    file: PathBuf,
    /// Emit JSON instead of tab-separated lines.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct PropertyArgs {
    #[command(subcommand)]
    action: PropertyAction,
}

#[derive(Debug, Subcommand)]
enum PropertyAction {
    /// Print the value of KEY for the heading enclosing --line.
    Get(PropertyGetArgs),
    /// Set KEY for the heading enclosing --line, creating the drawer if needed.
    Set(PropertySetArgs),
}

#[derive(Debug, Args)]
struct PropertyGetArgs {
    file: PathBuf,
    #[arg(long)]
    line: usize,
    key: String,
}

#[derive(Debug, Args)]
struct PropertySetArgs {
    file: PathBuf,
    #[arg(long)]
    line: usize,
    key: String,
    value: String,
    /// Overwrite the file instead of printing the result to stdout.
    #[arg(long)]
    in_place: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let output = run(&cli)?;
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("org_edit=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("org_edit=warn"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Runs one command and returns what belongs on stdout.
fn run(cli: &Cli) -> Result<String> {
    match &cli.command {
        Commands::Context(args) => handle_context(args, cli),
        Commands::Subtree(args) => handle_subtree(args, cli),
        Commands::Edit(args) => handle_edit(args, cli),
        Commands::Links(args) => handle_links(args),
        Commands::Property(args) => match &args.action {
            PropertyAction::Get(args) => handle_property_get(args, cli),
            PropertyAction::Set(args) => handle_property_set(args, cli),
        },
    }
}

fn handle_context(args: &ContextArgs, cli: &Cli) -> Result<String> {
    let doc = load_document(&args.cursor.file)?;
    let config = resolve_config(cli, &doc)?;
    let position = cursor_position(&doc, args.cursor.line, args.cursor.column)?;
    let context = analyze_context(&doc, position, &config);
    if args.json {
        return serde_json::to_string_pretty(&context).context("serializing context");
    }
    Ok(format!("{} (line {})", context.kind(), context.line() + 1))
}

fn handle_subtree(args: &SubtreeArgs, cli: &Cli) -> Result<String> {
    let doc = load_document(&args.file)?;
    let config = resolve_config(cli, &doc)?;
    let line = line_index(&doc, args.line)?;
    let Some((start, enclosing)) = heading::find_current_heading(&doc, line, &config.keywords)
    else {
        anyhow::bail!("no heading encloses line {}", args.line);
    };
    let end = heading::find_subtree_end(&doc, start);
    Ok(format!("{}-{}\t{}", start + 1, end + 1, heading::build(&enclosing)))
}

fn handle_edit(args: &EditArgs, cli: &Cli) -> Result<String> {
    let path = &args.cursor.file;
    let mut doc = load_document(path)?;
    let config = resolve_config(cli, &doc)?;
    let position = cursor_position(&doc, args.cursor.line, args.cursor.column)?;
    let outcome = StructuralEditor::new(&config)
        .execute(&mut doc, position, args.action.command())
        .with_context(|| format!("running {:?} in {:?}", args.action, path))?;
    debug!(?outcome, "edit finished");

    if args.in_place {
        if matches!(outcome, Outcome::Cursor(_)) {
            write_document(path, &doc)?;
        }
        return Ok(describe(outcome));
    }
    eprintln!("{}", describe(outcome));
    Ok(doc.text())
}

/// One-line, 1-based summary of what the host should do next.
fn describe(outcome: Outcome) -> String {
    match outcome {
        Outcome::Cursor(at) => format!("cursor {}:{}", at.line + 1, at.character + 1),
        Outcome::Fold(span) => format!("fold {}-{}", span.start + 1, span.end + 1),
        Outcome::Unchanged => "unchanged".to_string(),
    }
}

fn handle_links(args: &LinksArgs) -> Result<String> {
    let doc = load_document(&args.file)?;
    let links: Vec<(usize, Link)> = (0..doc.line_count())
        .flat_map(|n| {
            link::parse_links(doc.line_at(n))
                .into_iter()
                .map(move |l| (n, l))
        })
        .collect();

    if args.json {
        #[derive(serde::Serialize)]
        struct JsonLink<'a> {
            line: usize,
            #[serde(flatten)]
            link: &'a Link,
        }

        let payload: Vec<JsonLink<'_>> = links
            .iter()
            .map(|(n, link)| JsonLink { line: n + 1, link })
            .collect();
        return serde_json::to_string_pretty(&payload).context("serializing links");
    }

    Ok(links
        .iter()
        .map(|(n, l)| {
            format!(
                "{}:{}\t{}\t{}",
                n + 1,
                l.start + 1,
                l.raw_target,
                l.description.as_deref().unwrap_or("")
            )
        })
        .collect::<Vec<_>>()
        .join("\n"))
}

fn handle_property_get(args: &PropertyGetArgs, cli: &Cli) -> Result<String> {
    let doc = load_document(&args.file)?;
    let config = resolve_config(cli, &doc)?;
    let heading_line = enclosing_heading(&doc, args.line, &config)?;
    property::get_property(&doc, heading_line, &args.key, &config)
        .with_context(|| format!("property {} is not set", args.key))
}

fn handle_property_set(args: &PropertySetArgs, cli: &Cli) -> Result<String> {
    let mut doc = load_document(&args.file)?;
    let config = resolve_config(cli, &doc)?;
    let heading_line = enclosing_heading(&doc, args.line, &config)?;
    let edits = property::set_property(
        &doc,
        heading_line,
        &args.key,
        &args.value,
        &config,
        &mut UuidGenerator,
    );
    if !doc.apply_edits(&edits) {
        anyhow::bail!("could not write property {} in {:?}", args.key, args.file);
    }
    if args.in_place {
        write_document(&args.file, &doc)?;
        return Ok(String::new());
    }
    Ok(doc.text())
}

/* ------------------------------- Plumbing ------------------------------- */

fn load_document(path: &Path) -> Result<TextDocument> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    Ok(TextDocument::new(&text))
}

fn write_document(path: &Path, doc: &TextDocument) -> Result<()> {
    fs::write(path, doc.text().as_bytes()).with_context(|| format!("writing {:?}", path))
}

/// Defaults, then `--config`, then the file's own keyword directive, then `--keywords`.
fn resolve_config(cli: &Cli, doc: &TextDocument) -> Result<EditorConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw =
                fs::read_to_string(path).with_context(|| format!("reading config {:?}", path))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing config {:?}", path))?
        }
        None => EditorConfig::default(),
    };
    if let Some(set) = KeywordSet::from_document(doc) {
        debug!(keywords = %set, "using in-file keyword directive");
        config.keywords = set;
    }
    if let Some(sequence) = &cli.keywords {
        config.keywords = sequence
            .parse()
            .with_context(|| format!("parsing --keywords {:?}", sequence))?;
    }
    Ok(config)
}

fn line_index(doc: &TextDocument, line: usize) -> Result<usize> {
    if line == 0 || line > doc.line_count() {
        anyhow::bail!(
            "line {} is outside the file (1..={})",
            line,
            doc.line_count()
        );
    }
    Ok(line - 1)
}

fn cursor_position(doc: &TextDocument, line: usize, column: usize) -> Result<Position> {
    let line = line_index(doc, line)?;
    if column == 0 {
        anyhow::bail!("columns are 1-based");
    }
    Ok(Position::new(line, column - 1))
}

fn enclosing_heading(doc: &TextDocument, line: usize, config: &EditorConfig) -> Result<usize> {
    let line = line_index(doc, line)?;
    heading::find_current_heading(doc, line, &config.keywords)
        .map(|(n, _)| n)
        .with_context(|| format!("no heading encloses line {}", line + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(args: &[&str]) -> Result<String> {
        let cli = Cli::try_parse_from(std::iter::once("org-edit").chain(args.iter().copied()))?;
        run(&cli)
    }

    fn org_file(dir: &tempfile::TempDir, name: &str, text: &str) -> String {
        let path = dir.path().join(name);
        fs::write(&path, text).expect("write org file");
        path.to_str().expect("utf-8 path").to_string()
    }

    #[test]
    fn edit_in_place_rewrites_the_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = org_file(&tmp, "list.org", "1. a\n2. b");
        let out = run_args(&[
            "edit", &file, "--line", "1", "--column", "5", "insert-sibling", "--in-place",
        ])
        .expect("edit");
        assert_eq!(out, "cursor 2:4");
        assert_eq!(fs::read_to_string(&file).expect("read"), "1. a\n2. \n3. b");
    }

    #[test]
    fn in_place_edits_keep_crlf_endings() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = org_file(&tmp, "crlf.org", "1. a\r\n2. b\r\n");
        run_args(&[
            "edit", &file, "--line", "1", "--column", "5", "insert-sibling", "--in-place",
        ])
        .expect("edit");
        assert_eq!(fs::read_to_string(&file).expect("read"), "1. a\r\n2. \r\n3. b\r\n");
    }

    #[test]
    fn unchanged_edits_leave_the_file_alone() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = org_file(&tmp, "top.org", "* Top\n");
        let out = run_args(&[
            "edit", &file, "--line", "1", "--column", "1", "promote", "--in-place",
        ])
        .expect("edit");
        assert_eq!(out, "unchanged");
        assert_eq!(fs::read_to_string(&file).expect("read"), "* Top\n");
    }

    #[test]
    fn in_file_keywords_apply_unless_overridden() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = org_file(&tmp, "kw.org", "#+TODO: OPEN | SHUT\n* OPEN Task");
        let out = run_args(&["edit", &file, "--line", "2", "--column", "1", "cycle-keyword"])
            .expect("edit");
        assert_eq!(out, "#+TODO: OPEN | SHUT\n* SHUT Task");

        let out = run_args(&[
            "--keywords",
            "A | B",
            "edit",
            &file,
            "--line",
            "2",
            "--column",
            "1",
            "cycle-keyword",
        ])
        .expect("edit");
        assert_eq!(out, "#+TODO: OPEN | SHUT\n* A OPEN Task");
    }

    #[test]
    fn config_file_sets_indent_width() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = org_file(&tmp, "list.org", "- a\n- b");
        let config = org_file(&tmp, "config.json", r#"{"indent_width": 4}"#);
        let out = run_args(&[
            "--config", &config, "edit", &file, "--line", "2", "--column", "3", "demote",
        ])
        .expect("edit");
        assert_eq!(out, "- a\n    - b");
    }

    #[test]
    fn bad_config_is_reported() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = org_file(&tmp, "a.org", "* A");
        let config = org_file(&tmp, "config.json", "{ nope");
        let err = run_args(&["--config", &config, "subtree", &file, "--line", "1"])
            .expect_err("invalid json");
        assert!(err.to_string().contains("parsing config"));
    }

    #[test]
    fn context_as_json() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = org_file(&tmp, "c.org", "* H\n  - [ ] item");
        let out = run_args(&["context", &file, "--line", "2", "--column", "5", "--json"])
            .expect("context");
        let value: serde_json::Value = serde_json::from_str(&out).expect("json");
        assert_eq!(value["kind"], "checkbox");
        assert_eq!(value["item"]["indent"], 2);

        let out = run_args(&["context", &file, "--line", "1", "--column", "1"]).expect("context");
        assert_eq!(out, "heading (line 1)");
    }

    #[test]
    fn positions_are_one_based() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = org_file(&tmp, "a.org", "* A");
        assert!(run_args(&["context", &file, "--line", "0", "--column", "1"]).is_err());
        assert!(run_args(&["context", &file, "--line", "1", "--column", "0"]).is_err());
        assert!(run_args(&["context", &file, "--line", "2", "--column", "1"]).is_err());
    }

    #[test]
    fn subtree_span() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = org_file(&tmp, "s.org", "* H1\n** H2\nContent\n*** H3\nmore\n* H4");
        let out = run_args(&["subtree", &file, "--line", "3"]).expect("subtree");
        assert_eq!(out, "2-5\t** H2");
    }

    #[test]
    fn properties_round_trip_through_the_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = org_file(&tmp, "p.org", "* Task\nbody");
        run_args(&["property", "set", &file, "--line", "2", "effort", "1h", "--in-place"])
            .expect("set");
        let written = fs::read_to_string(&file).expect("read");
        assert!(written.starts_with("* Task\n:PROPERTIES:\n:ID: "));
        assert!(written.ends_with(":EFFORT: 1h\n:END:\nbody"));

        let value = run_args(&["property", "get", &file, "--line", "1", "Effort"]).expect("get");
        assert_eq!(value, "1h");
        assert!(run_args(&["property", "get", &file, "--line", "1", "missing"]).is_err());
    }

    #[test]
    fn links_listing() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = org_file(&tmp, "l.org", "* H\nsee [[id:42][answer]] and https://x.org");
        let out = run_args(&["links", &file]).expect("links");
        assert_eq!(out, "2:5\tid:42\tanswer\n2:27\thttps://x.org\t");

        let out = run_args(&["links", &file, "--json"]).expect("links json");
        let value: serde_json::Value = serde_json::from_str(&out).expect("json");
        assert_eq!(value[0]["line"], 2);
        assert_eq!(value[0]["target"]["kind"], "id");
        assert_eq!(value[1]["syntax"], "bare-url");
    }
}
