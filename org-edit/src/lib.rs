//! Structural editing engine for Org-style outline buffers.
//! Nothing is cached between calls: every query rebuilds the slice of the tree it
//! needs from line text and indentation, so the host may change the buffer freely.

pub mod core {
    use nom::{IResult, error::VerboseError};
    use serde::{Deserialize, Serialize};
    use serde_with::{DisplayFromStr, serde_as};
    use std::{fmt, str::FromStr};
    use uuid::Uuid;

    pub(crate) type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /* ------------------------------ Positions ------------------------------ */

    /// Zero-based cursor coordinates; `character` counts Unicode scalar values.
    #[derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
    )]
    pub struct Position {
        pub line: usize,
        pub character: usize,
    }

    impl Position {
        pub fn new(line: usize, character: usize) -> Self {
            Self { line, character }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Range {
        pub start: Position,
        pub end: Position,
    }

    impl Range {
        pub fn new(start: Position, end: Position) -> Self {
            Self { start, end }
        }

        pub fn point(at: Position) -> Self {
            Self { start: at, end: at }
        }

        /// Columns `[from, to)` of a single line.
        pub fn on_line(line: usize, from: usize, to: usize) -> Self {
            Self::new(Position::new(line, from), Position::new(line, to))
        }

        pub fn is_empty(&self) -> bool {
            self.start == self.end
        }
    }

    /// One replacement expressed against the snapshot the batch was computed from.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TextEdit {
        pub range: Range,
        pub new_text: String,
    }

    impl TextEdit {
        pub fn replace(range: Range, new_text: impl Into<String>) -> Self {
            Self {
                range,
                new_text: new_text.into(),
            }
        }

        pub fn insert(at: Position, text: impl Into<String>) -> Self {
            Self::replace(Range::point(at), text)
        }

        pub fn delete(range: Range) -> Self {
            Self::replace(range, "")
        }
    }

    /// Inclusive span of lines.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct LineSpan {
        pub start: usize,
        pub end: usize,
    }

    /// Edits computed against one snapshot plus the cursor the host should select
    /// once they are applied. An empty batch is a pure cursor move.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct EditBatch {
        pub edits: Vec<TextEdit>,
        pub cursor: Position,
    }

    impl EditBatch {
        pub fn new(edits: Vec<TextEdit>, cursor: Position) -> Self {
            Self { edits, cursor }
        }

        pub fn cursor_only(cursor: Position) -> Self {
            Self {
                edits: vec![],
                cursor,
            }
        }
    }

    /// What a structural command asks of the host.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "action", rename_all = "kebab-case")]
    pub enum EditPlan {
        Apply(EditBatch),
        /// Fold the given lines; the buffer is not touched.
        Fold(LineSpan),
        Unchanged,
    }

    /* ------------------------------ Host seams ------------------------------ */

    /// Read-only view of a line-addressable buffer snapshot.
    pub trait Document {
        fn line_count(&self) -> usize;

        /// Line text without its terminator. Lines past the end read as empty.
        fn line_at(&self, line: usize) -> &str;

        fn text(&self) -> String;

        fn line_range(&self, line: usize) -> Range {
            Range::on_line(line, 0, char_len(self.line_at(line)))
        }

        fn last_line(&self) -> usize {
            self.line_count().saturating_sub(1)
        }

        fn is_blank(&self, line: usize) -> bool {
            self.line_at(line).trim().is_empty()
        }
    }

    /// Host-side edit application: the whole batch lands, or nothing does.
    pub trait EditHost: Document {
        fn apply_edits(&mut self, edits: &[TextEdit]) -> bool;
    }

    /// Source of collision-resistant tokens for new `ID` properties.
    pub trait IdGenerator {
        fn generate(&mut self) -> String;
    }

    #[derive(Debug, Clone, Copy, Default)]
    pub struct UuidGenerator;

    impl IdGenerator for UuidGenerator {
        fn generate(&mut self) -> String {
            Uuid::new_v4().to_string()
        }
    }

    /* ----------------------------- Line helpers ----------------------------- */

    /// Leading whitespace width; tabs count as one column.
    pub fn indent_of(text: &str) -> usize {
        text.chars().take_while(|c| *c == ' ' || *c == '\t').count()
    }

    pub fn char_len(text: &str) -> usize {
        text.chars().count()
    }

    /// Byte offset of the `character`-th scalar, clamped to the end of `text`.
    pub fn byte_offset(text: &str, character: usize) -> usize {
        text.char_indices()
            .nth(character)
            .map(|(idx, _)| idx)
            .unwrap_or(text.len())
    }

    /// Clamp a position onto an existing line and column of `doc`.
    pub fn clamp_position(doc: &impl Document, position: Position) -> Position {
        let line = position.line.min(doc.last_line());
        let character = position.character.min(char_len(doc.line_at(line)));
        Position::new(line, character)
    }

    /// Insert whole lines so they start at snapshot line `at`; `at == line_count`
    /// appends after the last line.
    pub fn insert_lines(doc: &impl Document, at: usize, lines: &[String]) -> TextEdit {
        let joined = lines.join("\n");
        if doc.line_count() == 0 {
            TextEdit::insert(Position::new(0, 0), joined)
        } else if at < doc.line_count() {
            TextEdit::insert(Position::new(at, 0), format!("{joined}\n"))
        } else {
            let last = doc.last_line();
            let end = char_len(doc.line_at(last));
            TextEdit::insert(Position::new(last, end), format!("\n{joined}"))
        }
    }

    pub fn insert_line(doc: &impl Document, at: usize, text: impl Into<String>) -> TextEdit {
        insert_lines(doc, at, &[text.into()])
    }

    /* ----------------------------- Keyword set ----------------------------- */

    /// Ordered heading-state vocabulary, written like an `#+TODO:` line:
    /// `TODO NEXT | DONE CANCELLED`. Without a `|` the last word is the only done state.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct KeywordSet {
        active: Vec<String>,
        done: Vec<String>,
    }

    impl KeywordSet {
        pub fn new<I, J, S, T>(active: I, done: J) -> Self
        where
            I: IntoIterator<Item = S>,
            J: IntoIterator<Item = T>,
            S: Into<String>,
            T: Into<String>,
        {
            Self {
                active: active.into_iter().map(Into::into).collect(),
                done: done.into_iter().map(Into::into).collect(),
            }
        }

        pub fn all(&self) -> impl Iterator<Item = &str> {
            self.active.iter().chain(self.done.iter()).map(String::as_str)
        }

        pub fn contains(&self, word: &str) -> bool {
            self.all().any(|k| k == word)
        }

        pub fn is_done(&self, word: &str) -> bool {
            self.done.iter().any(|k| k == word)
        }

        /// Next state in the cycle `none → first → … → last → none`. Unknown words restart it.
        pub fn next_after(&self, current: Option<&str>) -> Option<&str> {
            let words: Vec<&str> = self.all().collect();
            match current.and_then(|word| words.iter().position(|k| *k == word)) {
                Some(idx) => words.get(idx + 1).copied(),
                None => words.first().copied(),
            }
        }

        /// Reads an in-buffer `#+TODO:`, `#+SEQ_TODO:` or `#+TYP_TODO:` directive.
        pub fn from_directive(line: &str) -> Option<Self> {
            let trimmed = line.trim();
            let (key, value) = trimmed.strip_prefix("#+")?.split_once(':')?;
            let key = key.to_ascii_uppercase();
            if !matches!(key.as_str(), "TODO" | "SEQ_TODO" | "TYP_TODO") {
                return None;
            }
            value.parse().ok()
        }

        /// First keyword directive found in `doc`, if any.
        pub fn from_document(doc: &impl Document) -> Option<Self> {
            (0..doc.line_count()).find_map(|n| Self::from_directive(doc.line_at(n)))
        }
    }

    impl Default for KeywordSet {
        fn default() -> Self {
            Self::new(["TODO"], ["DONE"])
        }
    }

    impl FromStr for KeywordSet {
        type Err = DomainError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            // Fast-access keys such as `TODO(t)` or `DONE(d!)` are dropped.
            let word = |w: &str| w.split('(').next().unwrap_or(w).to_string();
            let (active, done): (Vec<String>, Vec<String>) = match s.split_once('|') {
                Some((a, d)) => (
                    a.split_whitespace().map(word).collect(),
                    d.split_whitespace().map(word).collect(),
                ),
                None => {
                    let mut words: Vec<String> = s.split_whitespace().map(word).collect();
                    let last = words.pop().ok_or(DomainError::EmptyKeywordSequence)?;
                    (words, vec![last])
                }
            };
            if active.is_empty() && done.is_empty() {
                return Err(DomainError::EmptyKeywordSequence);
            }
            Ok(Self { active, done })
        }
    }

    impl fmt::Display for KeywordSet {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{} | {}", self.active.join(" "), self.done.join(" "))
        }
    }

    /* ---------------------------- Configuration ---------------------------- */

    /// Settings threaded explicitly through every grammar call.
    #[serde_as]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct EditorConfig {
        #[serde_as(as = "DisplayFromStr")]
        #[serde(default)]
        pub keywords: KeywordSet,

        /// Columns added or removed when a list item is indented or outdented.
        #[serde(default = "EditorConfig::default_indent_width")]
        pub indent_width: usize,

        /// Consecutive blank lines that detach text from the list item above it.
        #[serde(default = "EditorConfig::default_blank_run_limit")]
        pub blank_run_limit: usize,

        /// Lines below a heading searched for its `:PROPERTIES:` marker.
        #[serde(default = "EditorConfig::default_drawer_scan_limit")]
        pub drawer_scan_limit: usize,

        /// Lowest level a promotion may reach.
        #[serde(default = "EditorConfig::default_min_level")]
        pub min_level: usize,
    }

    impl Default for EditorConfig {
        fn default() -> Self {
            Self {
                keywords: KeywordSet::default(),
                indent_width: Self::default_indent_width(),
                blank_run_limit: Self::default_blank_run_limit(),
                drawer_scan_limit: Self::default_drawer_scan_limit(),
                min_level: Self::default_min_level(),
            }
        }
    }

    impl EditorConfig {
        fn default_indent_width() -> usize {
            2
        }

        fn default_blank_run_limit() -> usize {
            2
        }

        fn default_drawer_scan_limit() -> usize {
            32
        }

        fn default_min_level() -> usize {
            1
        }

        pub fn with_keywords(mut self, keywords: KeywordSet) -> Self {
            self.keywords = keywords;
            self
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum DomainError {
        #[error("keyword sequence is empty")]
        EmptyKeywordSequence,
        #[error("position {line}:{character} is outside the document ({line_count} lines)")]
        PositionOutOfBounds {
            line: usize,
            character: usize,
            line_count: usize,
        },
        #[error("host rejected the edit batch")]
        BatchRejected,
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn keyword_set_parses_divider_and_fast_keys() {
            let set: KeywordSet = "TODO(t) NEXT | DONE(d!) CANCELLED".parse().expect("parse");
            assert!(set.contains("NEXT"));
            assert!(set.is_done("DONE"));
            assert!(!set.is_done("TODO"));
            assert_eq!(set.to_string(), "TODO NEXT | DONE CANCELLED");
        }

        #[test]
        fn keyword_set_without_divider_marks_last_done() {
            let set: KeywordSet = "TODO WAIT FINISHED".parse().expect("parse");
            assert!(set.is_done("FINISHED"));
            assert!(!set.is_done("WAIT"));
            assert!("   ".parse::<KeywordSet>().is_err());
        }

        #[test]
        fn keyword_cycle_wraps_to_none() {
            let set = KeywordSet::default();
            assert_eq!(set.next_after(None), Some("TODO"));
            assert_eq!(set.next_after(Some("TODO")), Some("DONE"));
            assert_eq!(set.next_after(Some("DONE")), None);
            assert_eq!(set.next_after(Some("WAIT")), Some("TODO"));
        }

        #[test]
        fn directive_overrides_are_recognized() {
            let set = KeywordSet::from_directive("#+seq_todo: OPEN | CLOSED").expect("directive");
            assert!(set.contains("OPEN"));
            assert!(KeywordSet::from_directive("#+title: nope").is_none());
        }

        #[test]
        fn config_defaults_fill_missing_fields() {
            let cfg: EditorConfig =
                serde_json::from_str(r#"{"keywords": "TODO | DONE WONTFIX", "indent_width": 4}"#)
                    .expect("config json");
            assert_eq!(cfg.indent_width, 4);
            assert_eq!(cfg.blank_run_limit, 2);
            assert_eq!(cfg.min_level, 1);
            assert!(cfg.keywords.is_done("WONTFIX"));

            let empty: EditorConfig = serde_json::from_str("{}").expect("empty json");
            assert_eq!(empty, EditorConfig::default());
        }

        #[test]
        fn byte_offset_counts_scalars() {
            assert_eq!(byte_offset("héllo", 2), 3);
            assert_eq!(byte_offset("abc", 10), 3);
            assert_eq!(indent_of("\t  - x"), 3);
        }
    }
}

pub mod document {
    //! In-memory snapshot used by the command-line host and the tests.

    use crate::core::*;
    use std::cmp::Reverse;
    use std::fmt;

    /// Lines are stored without terminators; the terminator seen on load is
    /// restored whenever the text is rendered.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct TextDocument {
        lines: Vec<String>,
        newline: &'static str,
    }

    impl TextDocument {
        pub fn new(text: &str) -> Self {
            let newline = if text.contains("\r\n") { "\r\n" } else { "\n" };
            Self::with_newline(text, newline)
        }

        fn with_newline(text: &str, newline: &'static str) -> Self {
            Self {
                lines: text
                    .split('\n')
                    .map(|l| l.strip_suffix('\r').unwrap_or(l).to_string())
                    .collect(),
                newline,
            }
        }

        pub fn lines(&self) -> &[String] {
            &self.lines
        }

        /// `"\r\n"` for CRLF buffers, `"\n"` otherwise.
        pub fn newline(&self) -> &str {
            self.newline
        }

        fn line_starts(&self) -> Vec<usize> {
            let mut starts = Vec::with_capacity(self.lines.len());
            let mut acc = 0;
            for line in &self.lines {
                starts.push(acc);
                acc += line.len() + 1;
            }
            starts
        }

        fn offset_of(&self, starts: &[usize], pos: Position) -> Option<usize> {
            let line = self.lines.get(pos.line)?;
            Some(starts[pos.line] + byte_offset(line, pos.character))
        }
    }

    impl Default for TextDocument {
        fn default() -> Self {
            Self::new("")
        }
    }

    impl fmt::Display for TextDocument {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.lines.join(self.newline))
        }
    }

    impl Document for TextDocument {
        fn line_count(&self) -> usize {
            self.lines.len()
        }

        fn line_at(&self, line: usize) -> &str {
            self.lines.get(line).map(String::as_str).unwrap_or("")
        }

        fn text(&self) -> String {
            self.lines.join(self.newline)
        }
    }

    struct Resolved<'e> {
        start: usize,
        end: usize,
        text: &'e str,
        order: usize,
    }

    impl Resolved<'_> {
        fn is_insert(&self) -> bool {
            self.start == self.end
        }

        fn conflicts_with(&self, other: &Resolved<'_>) -> bool {
            match (self.is_insert(), other.is_insert()) {
                (true, true) => false,
                (true, false) => other.start < self.start && self.start < other.end,
                (false, true) => self.start < other.start && other.start < self.end,
                (false, false) => self.start < other.end && other.start < self.end,
            }
        }
    }

    impl EditHost for TextDocument {
        /// Every offset is resolved against the current text before anything changes;
        /// edits then land back to front so earlier offsets stay valid.
        fn apply_edits(&mut self, edits: &[TextEdit]) -> bool {
            let starts = self.line_starts();
            let mut resolved = Vec::with_capacity(edits.len());
            for (order, edit) in edits.iter().enumerate() {
                let (Some(start), Some(end)) = (
                    self.offset_of(&starts, edit.range.start),
                    self.offset_of(&starts, edit.range.end),
                ) else {
                    return false;
                };
                if start > end {
                    return false;
                }
                resolved.push(Resolved {
                    start,
                    end,
                    text: &edit.new_text,
                    order,
                });
            }

            for (i, a) in resolved.iter().enumerate() {
                if resolved[i + 1..].iter().any(|b| a.conflicts_with(b)) {
                    return false;
                }
            }

            // Same start: replacements first, then inserts in reverse order so the
            // inserted text ends up before the replaced span and in batch order.
            resolved.sort_by_key(|r| (Reverse(r.start), r.is_insert(), Reverse(r.order)));

            // Offsets were resolved against `\n`-joined lines; edits use `\n` too.
            let mut text = self.lines.join("\n");
            for r in &resolved {
                text.replace_range(r.start..r.end, r.text);
            }
            *self = TextDocument::with_newline(&text, self.newline);
            true
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn batch_offsets_come_from_the_original_snapshot() {
            let mut doc = TextDocument::new("1. a\n2. b\n3. c");
            let edits = vec![
                TextEdit::replace(Range::on_line(1, 0, 1), "3"),
                TextEdit::replace(Range::on_line(2, 0, 1), "4"),
                TextEdit::insert(Position::new(1, 0), "2. new\n"),
            ];
            assert!(doc.apply_edits(&edits));
            assert_eq!(doc.text(), "1. a\n2. new\n3. b\n4. c");
        }

        #[test]
        fn overlapping_edits_are_rejected_without_changes() {
            let mut doc = TextDocument::new("hello world");
            let edits = vec![
                TextEdit::replace(Range::on_line(0, 0, 5), "bye"),
                TextEdit::replace(Range::on_line(0, 3, 8), "x"),
            ];
            assert!(!doc.apply_edits(&edits));
            assert_eq!(doc.text(), "hello world");
        }

        #[test]
        fn edits_past_the_last_line_are_rejected() {
            let mut doc = TextDocument::new("one");
            assert!(!doc.apply_edits(&[TextEdit::insert(Position::new(4, 0), "x")]));
        }

        #[test]
        fn appending_after_the_last_line() {
            let doc = TextDocument::new("* A\nbody");
            let edit = insert_line(&doc, 2, "* B");
            let mut doc = doc;
            assert!(doc.apply_edits(&[edit]));
            assert_eq!(doc.text(), "* A\nbody\n* B");
        }

        #[test]
        fn crlf_endings_survive_edits() {
            let mut doc = TextDocument::new("* A\r\nbody\r\n");
            assert_eq!(doc.line_at(0), "* A");
            assert_eq!(doc.text(), "* A\r\nbody\r\n");
            let edit = insert_line(&doc, 1, "* B");
            assert!(doc.apply_edits(&[edit]));
            assert_eq!(doc.text(), "* A\r\n* B\r\nbody\r\n");
            assert_eq!(doc.to_string(), doc.text());
            assert_eq!(TextDocument::new("a\nb").newline(), "\n");
        }

        #[test]
        fn unicode_columns_map_to_byte_offsets() {
            let mut doc = TextDocument::new("- héllo wörld");
            let edits = vec![TextEdit::replace(Range::on_line(0, 8, 13), "there")];
            assert!(doc.apply_edits(&edits));
            assert_eq!(doc.text(), "- héllo there");
        }
    }
}

pub mod heading {
    //! Headline grammar: `*` runs, keyword state, priority cookie, trailing tags,
    //! plus the subtree boundary rule the mutations share.

    use crate::core::*;
    use nom::{
        branch::alt,
        bytes::complete::{tag, take_while1},
        character::complete::{char, satisfy, space0, space1},
        combinator::{eof, opt, recognize},
        error::{VerboseError, VerboseErrorKind},
        multi::many1,
        sequence::{delimited, terminated},
    };
    use serde::{Deserialize, Serialize};
    use tracing::trace;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Heading {
        /// Length of the leading `*` run.
        pub level: usize,
        pub keyword: Option<String>,
        /// Single-letter priority like `[#A]`.
        pub priority: Option<char>,
        pub title: String,
        #[serde(default)]
        pub tags: Vec<String>,
    }

    impl Heading {
        pub fn new(level: usize, title: impl Into<String>) -> Self {
            Self {
                level,
                keyword: None,
                priority: None,
                title: title.into(),
                tags: vec![],
            }
        }
    }

    /// Level of a heading line, 0 when the line is not a heading.
    pub fn level_of(line: &str) -> usize {
        let stars = line.chars().take_while(|c| *c == '*').count();
        match line[stars..].chars().next() {
            Some(' ') | Some('\t') if stars > 0 => stars,
            _ => 0,
        }
    }

    pub fn parse(line: &str, keywords: &KeywordSet) -> Option<Heading> {
        parse_headline(line, keywords).ok().map(|(_, h)| h)
    }

    fn parse_headline<'a>(i: &'a str, keywords: &KeywordSet) -> PResult<'a, Heading> {
        let (i, stars) = recognize(many1(char('*')))(i)?;
        let (i, _) = space1(i)?;
        let (i, keyword) = opt(|i| keyword_token(i, keywords))(i)?;
        let (i, priority) = opt(terminated(
            delimited(tag("[#"), satisfy(|c| c.is_ascii_alphanumeric()), char(']')),
            space0,
        ))(i)?;
        let (title, tags) = split_tags(i);
        Ok((
            "",
            Heading {
                level: stars.len(),
                keyword,
                priority,
                title: title.to_string(),
                tags,
            },
        ))
    }

    fn keyword_token<'a>(i: &'a str, keywords: &KeywordSet) -> PResult<'a, String> {
        let (rest, word) = take_while1(|c: char| !c.is_whitespace())(i)?;
        if !keywords.contains(word) {
            return Err(nom::Err::Error(VerboseError {
                errors: vec![(i, VerboseErrorKind::Context("keyword"))],
            }));
        }
        let (rest, _) = space_or_end(rest)?;
        Ok((rest, word.to_string()))
    }

    fn space_or_end(i: &str) -> PResult<'_, &str> {
        alt((space1, eof))(i)
    }

    fn is_tag_char(c: char) -> bool {
        c.is_alphanumeric() || matches!(c, '_' | '@' | '#' | '%')
    }

    fn is_tag_group(s: &str) -> bool {
        s.len() >= 3
            && s.starts_with(':')
            && s.ends_with(':')
            && s[1..s.len() - 1]
                .split(':')
                .all(|t| !t.is_empty() && t.chars().all(is_tag_char))
    }

    fn split_tags(text: &str) -> (&str, Vec<String>) {
        let trimmed = text.trim_end();
        let (head, last) = match trimmed.rfind([' ', '\t']) {
            Some(pos) => (&trimmed[..pos], &trimmed[pos + 1..]),
            None => ("", trimmed),
        };
        if !is_tag_group(last) {
            return (trimmed, vec![]);
        }
        let tags = last
            .trim_matches(':')
            .split(':')
            .map(str::to_string)
            .collect();
        (head.trim_end(), tags)
    }

    /// Canonical headline text; `build(&parse(l)?) == l` for normalized lines.
    pub fn build(heading: &Heading) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(keyword) = &heading.keyword {
            parts.push(keyword.clone());
        }
        if let Some(p) = heading.priority {
            parts.push(format!("[#{p}]"));
        }
        if !heading.title.is_empty() {
            parts.push(heading.title.clone());
        }
        if !heading.tags.is_empty() {
            parts.push(format!(":{}:", heading.tags.join(":")));
        }
        format!("{} {}", "*".repeat(heading.level.max(1)), parts.join(" "))
    }

    /* --------------------------- Subtree boundaries --------------------------- */

    /// Why a forward subtree scan stopped.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum SubtreeExit {
        /// A heading at the same or a higher level starts the next subtree.
        SameOrHigherHeading(usize),
        EndOfDocument,
    }

    pub fn scan_subtree(doc: &impl Document, line: usize, level: usize) -> SubtreeExit {
        for n in line + 1..doc.line_count() {
            let other = level_of(doc.line_at(n));
            if other > 0 && other <= level {
                return SubtreeExit::SameOrHigherHeading(n);
            }
        }
        SubtreeExit::EndOfDocument
    }

    /// Last line of the subtree rooted at `line`. A non-heading line is its own subtree.
    pub fn find_subtree_end(doc: &impl Document, line: usize) -> usize {
        let level = level_of(doc.line_at(line));
        if level == 0 {
            return line;
        }
        let exit = scan_subtree(doc, line, level);
        trace!(line, ?exit, "subtree scan finished");
        match exit {
            SubtreeExit::SameOrHigherHeading(next) => next - 1,
            SubtreeExit::EndOfDocument => doc.last_line().max(line),
        }
    }

    /// Last non-blank line of `[start, end]`, or `start` when all are blank.
    pub fn last_content_line(doc: &impl Document, start: usize, end: usize) -> usize {
        (start..=end)
            .rev()
            .find(|&n| !doc.is_blank(n))
            .unwrap_or(start)
    }

    /// Nearest heading whose subtree contains `line`, the line itself included.
    pub fn find_current_heading(
        doc: &impl Document,
        line: usize,
        keywords: &KeywordSet,
    ) -> Option<(usize, Heading)> {
        let start = line.min(doc.last_line());
        (0..=start).rev().find_map(|n| {
            let heading = parse(doc.line_at(n), keywords)?;
            (n == line || find_subtree_end(doc, n) >= line).then_some((n, heading))
        })
    }

    /* ------------------------------- Mutations ------------------------------- */

    pub fn promote(doc: &impl Document, line: usize, config: &EditorConfig) -> Vec<TextEdit> {
        shift_subtree(doc, line, -1, config)
    }

    pub fn demote(doc: &impl Document, line: usize, config: &EditorConfig) -> Vec<TextEdit> {
        shift_subtree(doc, line, 1, config)
    }

    /// Moves every heading of the subtree by `delta` levels so relative depth is kept.
    /// An anchor already at the floor makes promotion a no-op for the whole subtree.
    fn shift_subtree(
        doc: &impl Document,
        line: usize,
        delta: isize,
        config: &EditorConfig,
    ) -> Vec<TextEdit> {
        let anchor = level_of(doc.line_at(line));
        let floor = config.min_level.max(1);
        if anchor == 0 || (delta < 0 && anchor <= floor) {
            return vec![];
        }
        let end = find_subtree_end(doc, line);
        (line..=end)
            .filter_map(|n| {
                let level = level_of(doc.line_at(n));
                if level == 0 {
                    return None;
                }
                let target = (level as isize + delta).max(floor as isize) as usize;
                (target != level)
                    .then(|| TextEdit::replace(Range::on_line(n, 0, level), "*".repeat(target)))
            })
            .collect()
    }

    /// Rewrites only the keyword slot of the headline at `line`.
    pub fn cycle_keyword(
        doc: &impl Document,
        line: usize,
        keywords: &KeywordSet,
    ) -> Option<TextEdit> {
        let text = doc.line_at(line);
        let heading = parse(text, keywords)?;
        let next = keywords.next_after(heading.keyword.as_deref());
        let gap = indent_of(&text[heading.level..]);
        let slot = heading.level + gap;
        match (&heading.keyword, next) {
            (None, None) => None,
            (None, Some(word)) => Some(TextEdit::insert(
                Position::new(line, slot),
                format!("{word} "),
            )),
            (Some(current), Some(word)) => Some(TextEdit::replace(
                Range::on_line(line, slot, slot + char_len(current)),
                word,
            )),
            (Some(current), None) => {
                let after = &text[slot + current.len()..];
                let trailing = indent_of(after);
                Some(TextEdit::delete(Range::on_line(
                    line,
                    slot,
                    slot + char_len(current) + trailing,
                )))
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::document::TextDocument;

        fn keywords() -> KeywordSet {
            "TODO NEXT | DONE".parse().expect("keywords")
        }

        fn apply(text: &str, edits: Vec<TextEdit>) -> String {
            let mut doc = TextDocument::new(text);
            assert!(doc.apply_edits(&edits));
            doc.text()
        }

        #[test]
        fn headline_fields() {
            let h = parse("** TODO [#A] Write report :work:urgent:", &keywords()).expect("heading");
            assert_eq!(h.level, 2);
            assert_eq!(h.keyword.as_deref(), Some("TODO"));
            assert_eq!(h.priority, Some('A'));
            assert_eq!(h.title, "Write report");
            assert_eq!(h.tags, vec!["work", "urgent"]);
        }

        #[test]
        fn marker_run_needs_a_separator() {
            assert!(parse("*bold* text", &keywords()).is_none());
            assert!(parse("***", &keywords()).is_none());
            assert!(parse(" * indented", &keywords()).is_none());
            assert_eq!(level_of("*** deep"), 3);
            assert_eq!(level_of("**"), 0);
            assert_eq!(parse("* ", &keywords()).expect("empty").title, "");
        }

        #[test]
        fn unknown_words_stay_in_the_title() {
            let h = parse("* WAITING on review", &keywords()).expect("heading");
            assert_eq!(h.keyword, None);
            assert_eq!(h.title, "WAITING on review");
            let h = parse("* TODOS list", &keywords()).expect("heading");
            assert_eq!(h.keyword, None);
        }

        #[test]
        fn time_like_tokens_are_not_tags() {
            let h = parse("* Meeting at 10:30", &keywords()).expect("heading");
            assert!(h.tags.is_empty());
            assert_eq!(h.title, "Meeting at 10:30");
            let h = parse("* :solo:", &keywords()).expect("heading");
            assert_eq!(h.title, "");
            assert_eq!(h.tags, vec!["solo"]);
        }

        #[test]
        fn canonical_lines_round_trip() {
            for line in [
                "* Plain",
                "** TODO Task",
                "*** DONE [#B] Finished thing :a:b:",
                "* [#C] Only priority",
                "* NEXT",
                "* ",
            ] {
                let h = parse(line, &keywords()).expect(line);
                assert_eq!(build(&h), line);
            }
        }

        #[test]
        fn build_normalizes_spacing() {
            let h = parse("*   TODO   Spaced    :x:", &keywords()).expect("heading");
            assert_eq!(build(&h), "* TODO Spaced :x:");
        }

        #[test]
        fn subtree_end_rules() {
            let doc = TextDocument::new("* H1\n** H2\nContent\n*** H3\nmore\n* H4");
            assert_eq!(find_subtree_end(&doc, 1), 4);
            assert_eq!(find_subtree_end(&doc, 0), 4);
            assert_eq!(find_subtree_end(&doc, 5), 5);

            let doc = TextDocument::new("** A\n** B\n* C");
            assert_eq!(find_subtree_end(&doc, 0), 0);
            assert_eq!(find_subtree_end(&doc, 1), 1);

            let doc = TextDocument::new("* A\n** B\n*** C\nbody");
            assert_eq!(find_subtree_end(&doc, 1), 3);
        }

        #[test]
        fn current_heading_is_nearest_enclosing() {
            let doc = TextDocument::new("intro\n* A\ntext\n** B\nmore\n* C");
            assert!(find_current_heading(&doc, 0, &keywords()).is_none());
            assert_eq!(find_current_heading(&doc, 2, &keywords()).map(|(n, _)| n), Some(1));
            assert_eq!(find_current_heading(&doc, 4, &keywords()).map(|(n, _)| n), Some(3));
            assert_eq!(find_current_heading(&doc, 5, &keywords()).map(|(n, _)| n), Some(5));
        }

        #[test]
        fn promote_and_demote_move_the_whole_subtree() {
            let text = "* Top\n** A\n*** A1\ntext\n** B";
            let cfg = EditorConfig::default();
            let doc = TextDocument::new(text);
            let demoted = apply(text, demote(&doc, 1, &cfg));
            assert_eq!(demoted, "* Top\n*** A\n**** A1\ntext\n** B");

            let doc = TextDocument::new(&demoted);
            let restored = apply(&demoted, promote(&doc, 1, &cfg));
            assert_eq!(restored, text);
        }

        #[test]
        fn promotion_stops_at_the_floor() {
            let text = "* Top\n** Child";
            let cfg = EditorConfig::default();
            let doc = TextDocument::new(text);
            assert!(promote(&doc, 0, &cfg).is_empty());

            // demote(promote(x)) is not x at the floor.
            let demoted = apply(text, demote(&doc, 0, &cfg));
            assert_eq!(demoted, "** Top\n*** Child");

            let deep = EditorConfig {
                min_level: 2,
                ..EditorConfig::default()
            };
            let doc = TextDocument::new(&demoted);
            assert!(promote(&doc, 0, &deep).is_empty());
        }

        #[test]
        fn keyword_cycles_in_place() {
            let kw = keywords();
            let step = |text: &str| {
                let doc = TextDocument::new(text);
                apply(text, cycle_keyword(&doc, 0, &kw).into_iter().collect())
            };
            assert_eq!(step("** Task :x:"), "** TODO Task :x:");
            assert_eq!(step("** TODO Task :x:"), "** NEXT Task :x:");
            assert_eq!(step("** NEXT Task"), "** DONE Task");
            assert_eq!(step("** DONE Task"), "** Task");
        }
    }
}

pub mod list {
    //! Plain-list grammar. Items carry their own indentation; nesting, sibling runs
    //! and item extents are all recovered by indentation scans.

    use crate::core::*;
    use crate::heading;
    use nom::{
        branch::alt,
        character::complete::{char, digit1, one_of, space0, space1},
        combinator::{eof, map, map_res, opt},
        sequence::{delimited, pair},
    };
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use tracing::trace;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    pub enum Bullet {
        Dash,
        Plus,
        Star,
        /// `N.` or `N)`.
        Ordered { number: u64, delimiter: char },
    }

    impl Bullet {
        pub fn is_ordered(&self) -> bool {
            matches!(self, Bullet::Ordered { .. })
        }

        /// Marker for the following sibling: unordered bullets repeat, numbers count up.
        pub fn next(&self) -> Bullet {
            match *self {
                Bullet::Ordered { number, delimiter } => Bullet::Ordered {
                    number: number.saturating_add(1),
                    delimiter,
                },
                other => other,
            }
        }

        pub fn with_number(self, number: u64) -> Bullet {
            match self {
                Bullet::Ordered { delimiter, .. } => Bullet::Ordered { number, delimiter },
                other => other,
            }
        }
    }

    impl fmt::Display for Bullet {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Bullet::Dash => f.write_str("-"),
                Bullet::Plus => f.write_str("+"),
                Bullet::Star => f.write_str("*"),
                Bullet::Ordered { number, delimiter } => write!(f, "{number}{delimiter}"),
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Checkbox {
        Empty,   // [ ]
        Partial, // [-]
        Checked, // [X]
    }

    impl Checkbox {
        pub fn as_char(self) -> char {
            match self {
                Checkbox::Empty => ' ',
                Checkbox::Partial => '-',
                Checkbox::Checked => 'X',
            }
        }

        pub fn toggled(self) -> Checkbox {
            match self {
                Checkbox::Checked => Checkbox::Empty,
                Checkbox::Empty | Checkbox::Partial => Checkbox::Checked,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ListItem {
        pub indent: usize,
        pub bullet: Bullet,
        pub checkbox: Option<Checkbox>,
        pub content: String,
    }

    impl ListItem {
        pub fn is_ordered(&self) -> bool {
            self.bullet.is_ordered()
        }

        /// Empty sibling that follows this item: next marker, unchecked box if any.
        pub fn next_sibling(&self) -> ListItem {
            ListItem {
                indent: self.indent,
                bullet: self.bullet.next(),
                checkbox: self.checkbox.map(|_| Checkbox::Empty),
                content: String::new(),
            }
        }
    }

    pub fn parse(line: &str) -> Option<ListItem> {
        parse_list_item(line).ok().map(|(_, (item, _))| item)
    }

    /// Column where the item's content starts.
    pub fn content_start(line: &str) -> Option<usize> {
        let (_, (_, consumed)) = parse_list_item(line).ok()?;
        Some(char_len(&line[..consumed]))
    }

    fn parse_list_item(line: &str) -> PResult<'_, (ListItem, usize)> {
        // "- [ ] text", "+ text", "  * text", "1. text", "2) text"
        let (i, indent) = map(space0, char_len)(line)?;
        let (i, bullet) = alt((unordered_bullet, ordered_bullet))(i)?;
        if indent == 0 && bullet == Bullet::Star {
            // Column-zero stars belong to headlines.
            return Err(nom::Err::Error(nom::error::VerboseError {
                errors: vec![(i, nom::error::VerboseErrorKind::Context("star-bullet"))],
            }));
        }
        let (i, _) = space_or_end(i)?;
        let (i, checkbox) = opt(parse_checkbox)(i)?;
        let consumed = line.len() - i.len();
        let item = ListItem {
            indent,
            bullet,
            checkbox,
            content: i.trim_end().to_string(),
        };
        Ok(("", (item, consumed)))
    }

    fn space_or_end(i: &str) -> PResult<'_, &str> {
        alt((space1, eof))(i)
    }

    fn unordered_bullet(i: &str) -> PResult<'_, Bullet> {
        map(one_of("-+*"), |c| match c {
            '-' => Bullet::Dash,
            '+' => Bullet::Plus,
            _ => Bullet::Star,
        })(i)
    }

    fn ordered_bullet(i: &str) -> PResult<'_, Bullet> {
        map_res(pair(digit1, one_of(".)")), |(digits, delimiter): (&str, char)| {
            digits
                .parse::<u64>()
                .map(|number| Bullet::Ordered { number, delimiter })
        })(i)
    }

    fn parse_checkbox(i: &str) -> PResult<'_, Checkbox> {
        let (i, state) = delimited(
            char('['),
            alt((
                map(char(' '), |_| Checkbox::Empty),
                map(char('-'), |_| Checkbox::Partial),
                map(one_of("Xx"), |_| Checkbox::Checked),
            )),
            char(']'),
        )(i)?;
        let (i, _) = space_or_end(i)?;
        Ok((i, state))
    }

    pub fn build(item: &ListItem) -> String {
        let mut out = format!("{}{} ", " ".repeat(item.indent), item.bullet);
        if let Some(state) = item.checkbox {
            out.push('[');
            out.push(state.as_char());
            out.push_str("] ");
        }
        out.push_str(&item.content);
        out
    }

    /* ----------------------------- Item extents ----------------------------- */

    /// Why the forward scan for an item's last line stopped.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ItemEndExit {
        /// A list item or heading at the same or lower indentation.
        ItemOrHeading(usize),
        /// Plain text at the same or lower indentation.
        Dedent(usize),
        EndOfDocument,
    }

    /// Last non-blank line of the item at `line` and the reason the scan stopped.
    pub fn scan_item_end(doc: &impl Document, line: usize, indent: usize) -> (usize, ItemEndExit) {
        let mut last = line;
        for n in line + 1..doc.line_count() {
            let text = doc.line_at(n);
            if text.trim().is_empty() {
                continue;
            }
            if heading::level_of(text) > 0 {
                return (last, ItemEndExit::ItemOrHeading(n));
            }
            if indent_of(text) <= indent {
                let exit = if parse(text).is_some() {
                    ItemEndExit::ItemOrHeading(n)
                } else {
                    ItemEndExit::Dedent(n)
                };
                return (last, exit);
            }
            last = n;
        }
        (last, ItemEndExit::EndOfDocument)
    }

    /// Last line belonging to the item at `line`, nested content included.
    pub fn find_list_item_end(doc: &impl Document, line: usize, indent: usize) -> usize {
        let (last, exit) = scan_item_end(doc, line, indent);
        trace!(line, last, ?exit, "list item scan finished");
        last
    }

    pub fn has_sub_items(doc: &impl Document, line: usize, indent: usize) -> bool {
        (line + 1..doc.line_count())
            .map(|n| doc.line_at(n))
            .find(|text| !text.trim().is_empty())
            .is_some_and(|text| heading::level_of(text) == 0 && indent_of(text) > indent)
    }

    /* ------------------------------ Sibling runs ------------------------------ */

    /// Why a sibling-run scan stopped.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum RunExit {
        BlankRun,
        Heading,
        /// List item at a lower indentation: the parent level.
        Outdent,
        /// Plain text at the run's indentation or less ends the list.
        Paragraph,
        EndOfDocument,
    }

    enum RunLine {
        Blank,
        Sibling,
        Nested,
        Stop(RunExit),
    }

    fn classify_run_line(text: &str, indent: usize) -> RunLine {
        if text.trim().is_empty() {
            return RunLine::Blank;
        }
        if heading::level_of(text) > 0 {
            return RunLine::Stop(RunExit::Heading);
        }
        match parse(text) {
            Some(item) if item.indent == indent => RunLine::Sibling,
            Some(item) if item.indent > indent => RunLine::Nested,
            Some(_) => RunLine::Stop(RunExit::Outdent),
            None if indent_of(text) > indent => RunLine::Nested,
            None => RunLine::Stop(RunExit::Paragraph),
        }
    }

    /// Walks `lines` collecting siblings until a stop condition or a long blank run.
    fn walk_run(
        doc: &impl Document,
        lines: impl Iterator<Item = usize>,
        indent: usize,
        config: &EditorConfig,
        mut on_sibling: impl FnMut(usize),
    ) -> RunExit {
        let mut blanks = 0;
        for n in lines {
            match classify_run_line(doc.line_at(n), indent) {
                RunLine::Blank => {
                    blanks += 1;
                    if blanks >= config.blank_run_limit {
                        return RunExit::BlankRun;
                    }
                }
                RunLine::Sibling => {
                    blanks = 0;
                    on_sibling(n);
                }
                RunLine::Nested => blanks = 0,
                RunLine::Stop(exit) => return exit,
            }
        }
        RunExit::EndOfDocument
    }

    /// Every item line of the sibling run containing the item at `line`, in order.
    pub fn sibling_run(
        doc: &impl Document,
        line: usize,
        indent: usize,
        config: &EditorConfig,
    ) -> Vec<usize> {
        let mut first = line;
        let back = walk_run(doc, (0..line).rev(), indent, config, |n| first = n);
        let mut run = vec![first];
        let forward = walk_run(doc, first + 1..doc.line_count(), indent, config, |n| {
            run.push(n)
        });
        trace!(line, first, ?back, ?forward, size = run.len(), "collected sibling run");
        run
    }

    fn number_edit(doc: &impl Document, line: usize, number: u64) -> Option<TextEdit> {
        let text = doc.line_at(line);
        let item = parse(text)?;
        let Bullet::Ordered { number: old, .. } = item.bullet else {
            return None;
        };
        if old == number {
            return None;
        }
        let digits = text[item.indent..]
            .chars()
            .take_while(char::is_ascii_digit)
            .count();
        Some(TextEdit::replace(
            Range::on_line(line, item.indent, item.indent + digits),
            number.to_string(),
        ))
    }

    /// Marker changes for a new sibling inserted before snapshot line `insert_at`.
    ///
    /// Every number is decided from the snapshot before any edit exists, since the
    /// edits are positional: items before the insertion become `1..=k`, the new item
    /// takes `k + 1` (returned), items after it continue from `k + 2`. Only changed
    /// markers produce edits. `None` when the run is not ordered.
    pub fn renumber_for_insert(
        doc: &impl Document,
        anchor_line: usize,
        insert_at: usize,
        config: &EditorConfig,
    ) -> Option<(u64, Vec<TextEdit>)> {
        let anchor = parse(doc.line_at(anchor_line))?;
        if !anchor.is_ordered() {
            return None;
        }
        let run = sibling_run(doc, anchor_line, anchor.indent, config);
        let (before, after): (Vec<usize>, Vec<usize>) =
            run.into_iter().partition(|&n| n < insert_at);
        let new_number = before.len() as u64 + 1;
        let numbered = before
            .iter()
            .zip(1..)
            .chain(after.iter().zip(new_number + 1..));
        let edits = numbered
            .filter_map(|(&n, number)| number_edit(doc, n, number))
            .collect();
        Some((new_number, edits))
    }

    /// Renumbers the ordered run containing `line` as `1..=n`.
    pub fn renumber_run(doc: &impl Document, line: usize, config: &EditorConfig) -> Vec<TextEdit> {
        let Some(item) = parse(doc.line_at(line)) else {
            return vec![];
        };
        if !item.is_ordered() {
            return vec![];
        }
        sibling_run(doc, line, item.indent, config)
            .into_iter()
            .zip(1..)
            .filter_map(|(n, number)| number_edit(doc, n, number))
            .collect()
    }

    /* ------------------------------- Mutations ------------------------------- */

    /// Indents (`delta > 0`) or outdents the item at `line` with its nested content.
    pub fn shift_item(
        doc: &impl Document,
        line: usize,
        delta: isize,
        config: &EditorConfig,
    ) -> Vec<TextEdit> {
        let Some(item) = parse(doc.line_at(line)) else {
            return vec![];
        };
        let width = config.indent_width;
        if width == 0 || (delta < 0 && item.indent == 0) {
            return vec![];
        }
        let end = find_list_item_end(doc, line, item.indent);
        (line..=end)
            .filter(|&n| !doc.is_blank(n))
            .map(|n| {
                if delta > 0 {
                    TextEdit::insert(Position::new(n, 0), " ".repeat(width))
                } else {
                    let strip = width.min(indent_of(doc.line_at(n)));
                    TextEdit::delete(Range::on_line(n, 0, strip))
                }
            })
            .filter(|e| !(e.range.is_empty() && e.new_text.is_empty()))
            .collect()
    }

    pub fn toggle_checkbox(doc: &impl Document, line: usize) -> Option<TextEdit> {
        let text = doc.line_at(line);
        let item = parse(text)?;
        let state = item.checkbox?;
        let marker_end = item.indent + item.bullet.to_string().len();
        let open = marker_end + text[marker_end..].find('[')?;
        Some(TextEdit::replace(
            Range::on_line(line, open + 1, open + 2),
            state.toggled().as_char().to_string(),
        ))
    }

}

pub mod table {
    //! Grid rows delimited by `|`. Columns are character offsets within one line.

    /// `^\s*\|.*\|\s*$`
    pub fn is_table_line(line: &str) -> bool {
        let t = line.trim();
        t.len() >= 2 && t.starts_with('|') && t.ends_with('|')
    }

    /// Horizontal rule such as `|---+---|`.
    pub fn is_separator_row(line: &str) -> bool {
        is_table_line(line) && line.trim_start().starts_with("|-")
    }

    pub fn parse_row(line: &str) -> Vec<String> {
        if !is_table_line(line) {
            return vec![];
        }
        let fields: Vec<&str> = line.trim().split('|').collect();
        fields[1..fields.len() - 1]
            .iter()
            .map(|cell| cell.trim().to_string())
            .collect()
    }

    pub fn build_row(indent: usize, cells: &[String]) -> String {
        let pad = " ".repeat(indent);
        if cells.is_empty() {
            return format!("{pad}||");
        }
        format!("{pad}| {} |", cells.join(" | "))
    }

    /// An empty row with the same column layout; separator rows keep their columns.
    pub fn blank_row_like(line: &str) -> String {
        let separator = is_separator_row(line);
        let indent = crate::core::indent_of(line);
        let body: String = line
            .trim()
            .chars()
            .map(|c| match c {
                '|' => '|',
                '+' if separator => '|',
                _ => ' ',
            })
            .collect();
        format!("{}{}", " ".repeat(indent), body)
    }

    fn pipes(chars: &[char]) -> Vec<usize> {
        chars
            .iter()
            .enumerate()
            .filter_map(|(i, c)| (*c == '|').then_some(i))
            .collect()
    }

    /// First content column of the cell opened by the pipe at `pipe`.
    fn cell_start(chars: &[char], pipe: usize) -> usize {
        let mut col = pipe + 1;
        while chars.get(col) == Some(&' ') {
            col += 1;
        }
        if chars.get(col) == Some(&'|') {
            // Blank cell: sit one space in, never past the closing pipe.
            return (pipe + 2).min(col);
        }
        col
    }

    /// Start of the cell after the one containing `col`; `None` past the last cell.
    pub fn find_next_cell(line: &str, col: usize) -> Option<usize> {
        let chars: Vec<char> = line.chars().collect();
        let pipes = pipes(&chars);
        let last = *pipes.last()?;
        let pipe = *pipes.iter().find(|&&p| p >= col)?;
        (pipe != last).then(|| cell_start(&chars, pipe))
    }

    /// Start of the cell before the one containing `col`; `None` before the first cell.
    pub fn find_previous_cell(line: &str, col: usize) -> Option<usize> {
        let chars: Vec<char> = line.chars().collect();
        let pipes = pipes(&chars);
        let current = pipes.iter().rposition(|&p| p < col)?;
        let previous = current.checked_sub(1)?;
        Some(cell_start(&chars, pipes[previous]))
    }

    pub fn first_cell(line: &str) -> Option<usize> {
        find_next_cell(line, 0)
    }

    pub fn last_cell(line: &str) -> Option<usize> {
        let chars: Vec<char> = line.chars().collect();
        let pipes = pipes(&chars);
        let opening = pipes.len().checked_sub(2)?;
        Some(cell_start(&chars, pipes[opening]))
    }

    /// Zero-based index of the cell containing `col`.
    pub fn cell_index_at(line: &str, col: usize) -> Option<usize> {
        let chars: Vec<char> = line.chars().collect();
        let pipes = pipes(&chars);
        let opening = pipes.iter().rposition(|&p| p < col)?;
        (opening + 1 < pipes.len()).then_some(opening)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn recognizes_rows() {
            assert!(is_table_line("  | a | b |  "));
            assert!(is_table_line("|---+---|"));
            assert!(!is_table_line("| open"));
            assert!(!is_table_line("|"));
            assert!(is_separator_row("  |---+---|"));
            assert!(!is_separator_row("| - | x |"));
        }

        #[test]
        fn cells_are_trimmed() {
            assert_eq!(parse_row("| a |  b b |   |"), vec!["a", "b b", ""]);
            assert_eq!(
                build_row(2, &["x".to_string(), "y".to_string()]),
                "  | x | y |"
            );
        }

        #[test]
        fn blank_rows_keep_the_layout() {
            assert_eq!(blank_row_like("| ab | c |"), "|    |   |");
            assert_eq!(blank_row_like("  |----+---|"), "  |    |   |");
        }

        #[test]
        fn moves_between_cells() {
            let row = "| one | two |   |";
            assert_eq!(find_next_cell(row, 0), Some(2));
            assert_eq!(find_next_cell(row, 3), Some(8));
            assert_eq!(find_next_cell(row, 8), Some(14));
            assert_eq!(find_next_cell(row, 14), None);
            assert_eq!(find_previous_cell(row, 9), Some(2));
            assert_eq!(find_previous_cell(row, 3), None);
            assert_eq!(first_cell(row), Some(2));
            assert_eq!(last_cell(row), Some(14));
            assert_eq!(cell_index_at(row, 9), Some(1));
            assert_eq!(cell_index_at(row, 0), None);
        }
    }
}

pub mod property {
    //! `:PROPERTIES:` drawers attached to headlines.

    use crate::core::*;
    use crate::heading;
    use indexmap::IndexMap;
    use nom::{
        bytes::complete::take_while1,
        character::complete::{char, space0},
        sequence::delimited,
    };
    use serde::{Deserialize, Serialize};
    use tracing::{debug, trace};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PropertyDrawer {
        pub start_line: usize,
        pub end_line: usize,
    }

    impl PropertyDrawer {
        /// Lines strictly between the markers.
        pub fn interior(&self) -> std::ops::Range<usize> {
            self.start_line + 1..self.end_line
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PropertyEntry {
        pub indent: usize,
        pub key: String,
        pub value: String,
    }

    pub fn is_drawer_start(line: &str) -> bool {
        line.trim().eq_ignore_ascii_case(":PROPERTIES:")
    }

    pub fn is_drawer_end(line: &str) -> bool {
        line.trim().eq_ignore_ascii_case(":END:")
    }

    pub fn parse_entry(line: &str) -> Option<PropertyEntry> {
        if is_drawer_start(line) || is_drawer_end(line) {
            return None;
        }
        parse_property_line(line).ok().map(|(_, e)| e)
    }

    fn parse_property_line(i: &str) -> PResult<'_, PropertyEntry> {
        //  :KEY: value
        let (i, lead) = space0(i)?;
        let (rest, key) = delimited(
            char(':'),
            take_while1(|c: char| !c.is_whitespace() && c != ':'),
            char(':'),
        )(i)?;
        if !(rest.is_empty() || rest.starts_with([' ', '\t'])) {
            return Err(nom::Err::Error(nom::error::VerboseError {
                errors: vec![(rest, nom::error::VerboseErrorKind::Context("property"))],
            }));
        }
        Ok((
            "",
            PropertyEntry {
                indent: char_len(lead),
                key: key.to_string(),
                value: rest.trim().to_string(),
            },
        ))
    }

    pub fn build_entry(entry: &PropertyEntry) -> String {
        let pad = " ".repeat(entry.indent);
        if entry.value.is_empty() {
            format!("{pad}:{}:", entry.key)
        } else {
            format!("{pad}:{}: {}", entry.key, entry.value)
        }
    }

    /// Drawer belonging to the heading at `heading_line`. The start marker is searched
    /// for at most `drawer_scan_limit` lines; both markers must precede the next heading.
    pub fn find_property_drawer(
        doc: &impl Document,
        heading_line: usize,
        config: &EditorConfig,
    ) -> Option<PropertyDrawer> {
        let limit = (heading_line + 1 + config.drawer_scan_limit).min(doc.line_count());
        let start_line = (heading_line + 1..limit)
            .take_while(|&n| heading::level_of(doc.line_at(n)) == 0)
            .find(|&n| is_drawer_start(doc.line_at(n)))?;
        let end_line = closing_marker(doc, start_line + 1)?;
        Some(PropertyDrawer {
            start_line,
            end_line,
        })
    }

    fn closing_marker(doc: &impl Document, from: usize) -> Option<usize> {
        (from..doc.line_count())
            .take_while(|&n| heading::level_of(doc.line_at(n)) == 0)
            .find(|&n| is_drawer_end(doc.line_at(n)))
    }

    /// Terminated drawer whose interior or end marker contains `line`.
    pub fn drawer_containing(doc: &impl Document, line: usize) -> Option<PropertyDrawer> {
        if heading::level_of(doc.line_at(line)) > 0 {
            return None;
        }
        let mut open = None;
        for n in 0..line.min(doc.line_count()) {
            let text = doc.line_at(n);
            if heading::level_of(text) > 0 || is_drawer_end(text) {
                open = None;
            } else if is_drawer_start(text) {
                open = Some(n);
            }
        }
        let start_line = open?;
        let end_line = closing_marker(doc, line)?;
        trace!(line, start_line, end_line, "line is inside a property drawer");
        Some(PropertyDrawer {
            start_line,
            end_line,
        })
    }

    pub fn find_property_in_drawer(
        doc: &impl Document,
        drawer: &PropertyDrawer,
        key: &str,
    ) -> Option<(usize, PropertyEntry)> {
        drawer.interior().find_map(|n| {
            parse_entry(doc.line_at(n))
                .filter(|e| e.key.eq_ignore_ascii_case(key))
                .map(|e| (n, e))
        })
    }

    /// All entries of the drawer keyed upper-case, in buffer order.
    pub fn read_properties(doc: &impl Document, drawer: &PropertyDrawer) -> IndexMap<String, String> {
        drawer
            .interior()
            .filter_map(|n| parse_entry(doc.line_at(n)))
            .map(|e| (e.key.to_uppercase(), e.value))
            .collect()
    }

    pub fn get_property(
        doc: &impl Document,
        heading_line: usize,
        key: &str,
        config: &EditorConfig,
    ) -> Option<String> {
        let drawer = find_property_drawer(doc, heading_line, config)?;
        find_property_in_drawer(doc, &drawer, key).map(|(_, e)| e.value)
    }

    fn is_planning_line(line: &str) -> bool {
        let t = line.trim_start();
        ["SCHEDULED:", "DEADLINE:", "CLOSED:"]
            .iter()
            .any(|kw| t.starts_with(kw))
    }

    /// Writes `key` under the heading at `heading_line`: replaces the entry, appends it
    /// before `:END:`, or creates a drawer (with a fresh `ID`) after the headline and
    /// its planning line.
    pub fn set_property(
        doc: &impl Document,
        heading_line: usize,
        key: &str,
        value: &str,
        config: &EditorConfig,
        ids: &mut impl IdGenerator,
    ) -> Vec<TextEdit> {
        let key = key.to_uppercase();
        let value = value.trim().to_string();

        if let Some(drawer) = find_property_drawer(doc, heading_line, config) {
            if let Some((n, existing)) = find_property_in_drawer(doc, &drawer, &key) {
                let entry = PropertyEntry {
                    indent: existing.indent,
                    key,
                    value,
                };
                return vec![TextEdit::replace(doc.line_range(n), build_entry(&entry))];
            }
            let indent = drawer
                .interior()
                .find_map(|n| parse_entry(doc.line_at(n)))
                .map(|e| e.indent)
                .unwrap_or_else(|| indent_of(doc.line_at(drawer.start_line)));
            let entry = PropertyEntry { indent, key, value };
            return vec![insert_line(doc, drawer.end_line, build_entry(&entry))];
        }

        let mut at = heading_line + 1;
        if at < doc.line_count() && is_planning_line(doc.line_at(at)) {
            at += 1;
        }
        let mut lines = vec![":PROPERTIES:".to_string()];
        if key != "ID" {
            lines.push(build_entry(&PropertyEntry {
                indent: 0,
                key: "ID".into(),
                value: ids.generate(),
            }));
        }
        lines.push(build_entry(&PropertyEntry {
            indent: 0,
            key,
            value,
        }));
        lines.push(":END:".to_string());
        debug!(heading_line, at, "creating property drawer");
        vec![insert_lines(doc, at, &lines)]
    }

}

pub mod link {
    //! Bracketed `[[target][description]]` links and bare `https://` / `file:` links.

    use crate::core::*;
    use nom::{
        branch::alt,
        bytes::complete::{tag, take_until, take_while1},
        combinator::{opt, recognize, verify},
        sequence::preceded,
    };
    use serde::Serialize;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "kebab-case")]
    pub enum LinkSyntax {
        Bracketed,
        BareUrl,
        FileScheme,
    }

    #[non_exhaustive]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(tag = "kind", rename_all = "kebab-case")]
    pub enum LinkTarget {
        /// `file:path::search`, or a relative/absolute path.
        File {
            path: String,
            search: Option<String>,
        },
        Id {
            id: String,
        },
        /// `*Title`, `#custom-id`, or plain text searched among headlines.
        Headline {
            title: String,
        },
        Url {
            url: String,
        },
        Other {
            protocol: String,
            target: String,
        },
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Link {
        pub syntax: LinkSyntax,
        pub target: LinkTarget,
        pub raw_target: String,
        pub description: Option<String>,
        /// Character columns `[start, end)` of the whole link.
        pub start: usize,
        pub end: usize,
    }

    pub fn classify_target(t: &str) -> LinkTarget {
        let s = t.trim();
        if s.starts_with("http://") || s.starts_with("https://") {
            LinkTarget::Url { url: s.to_string() }
        } else if let Some(rem) = s.strip_prefix("id:") {
            LinkTarget::Id {
                id: rem.to_string(),
            }
        } else if let Some(rem) = s.strip_prefix("file:") {
            file_target(rem)
        } else if let Some(rem) = s.strip_prefix('*') {
            LinkTarget::Headline {
                title: rem.trim().to_string(),
            }
        } else if s.starts_with('#') {
            LinkTarget::Headline {
                title: s.to_string(),
            }
        } else if ["./", "../", "/", "~/"].iter().any(|p| s.starts_with(p)) {
            file_target(s)
        } else if let Some((protocol, rest)) = s.split_once(':') {
            LinkTarget::Other {
                protocol: protocol.to_string(),
                target: rest.to_string(),
            }
        } else {
            LinkTarget::Headline {
                title: s.to_string(),
            }
        }
    }

    fn file_target(rem: &str) -> LinkTarget {
        match rem.split_once("::") {
            Some((path, search)) => LinkTarget::File {
                path: path.to_string(),
                search: Some(search.to_string()),
            },
            None => LinkTarget::File {
                path: rem.to_string(),
                search: None,
            },
        }
    }

    fn parse_link_bracketed(i: &str) -> PResult<'_, (&str, Option<&str>)> {
        let (i, _) = tag("[[")(i)?;
        let (i, target) = verify(take_until("]"), |t: &str| !t.trim().is_empty())(i)?;
        let (i, desc) = opt(preceded(tag("]["), take_until("]]")))(i)?;
        let (i, _) = tag("]]")(i)?;
        Ok((i, (target, desc)))
    }

    fn link_body(i: &str) -> PResult<'_, &str> {
        take_while1(|c: char| !c.is_whitespace() && !matches!(c, ')' | ']' | '>'))(i)
    }

    fn parse_autolink(i: &str) -> PResult<'_, (&str, LinkSyntax)> {
        let (_, scheme) = alt((tag("https://"), tag("http://"), tag("file:")))(i)?;
        let (_, matched) = recognize(preceded(tag(scheme), link_body))(i)?;
        // Sentence punctuation right after a bare link is not part of it.
        let trimmed = matched.trim_end_matches([',', '.', ';', ':', '!', '?']);
        if trimmed.len() <= scheme.len() {
            return Err(nom::Err::Error(nom::error::VerboseError {
                errors: vec![(i, nom::error::VerboseErrorKind::Context("autolink"))],
            }));
        }
        let syntax = if scheme == "file:" {
            LinkSyntax::FileScheme
        } else {
            LinkSyntax::BareUrl
        };
        Ok((&i[trimmed.len()..], (trimmed, syntax)))
    }

    /// Every link on `line`, left to right.
    pub fn parse_links(line: &str) -> Vec<Link> {
        let mut out = Vec::new();
        let mut byte = 0;
        let mut col = 0;
        let mut prev: Option<char> = None;
        while byte < line.len() {
            let rest = &line[byte..];
            let at_boundary = prev.is_none_or(|c| c.is_whitespace() || matches!(c, '(' | '<'));

            let found = if let Ok((after, (target, desc))) = parse_link_bracketed(rest) {
                Some((
                    after,
                    LinkSyntax::Bracketed,
                    target,
                    desc.map(str::to_string),
                ))
            } else if at_boundary {
                parse_autolink(rest)
                    .ok()
                    .map(|(after, (target, syntax))| (after, syntax, target, None))
            } else {
                None
            };

            if let Some((after, syntax, target, description)) = found {
                let consumed = &rest[..rest.len() - after.len()];
                let width = char_len(consumed);
                out.push(Link {
                    syntax,
                    target: classify_target(target),
                    raw_target: target.trim().to_string(),
                    description,
                    start: col,
                    end: col + width,
                });
                byte += consumed.len();
                col += width;
                prev = consumed.chars().last();
                continue;
            }

            let Some(c) = rest.chars().next() else { break };
            byte += c.len_utf8();
            col += 1;
            prev = Some(c);
        }
        out
    }

    /// Link covering character column `col`, if any.
    pub fn link_at(line: &str, col: usize) -> Option<Link> {
        parse_links(line)
            .into_iter()
            .find(|l| l.start <= col && col < l.end)
    }

}

pub mod context {
    //! Classifies the cursor position into exactly one structural context.

    use crate::core::*;
    use crate::heading::{self, Heading};
    use crate::list::{self, ListItem};
    use crate::property::{self, PropertyDrawer, PropertyEntry};
    use crate::table;
    use nom::{
        bytes::complete::{tag_no_case, take_while1},
        character::complete::space0,
    };
    use serde::Serialize;
    use tracing::{debug, trace};

    /// Structural element under the cursor. `line` is the line that owns the
    /// element, which for nested list content is the item line, not the cursor line.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(tag = "kind", rename_all = "kebab-case")]
    pub enum Context {
        Heading {
            line: usize,
            heading: Heading,
        },
        ListItem {
            line: usize,
            item: ListItem,
        },
        Checkbox {
            line: usize,
            item: ListItem,
        },
        Table {
            line: usize,
            cells: Vec<String>,
            /// Cell under the cursor, `None` outside the pipes.
            column: Option<usize>,
        },
        CodeBlockHeader {
            line: usize,
            block: String,
            parameters: String,
        },
        CodeBlock {
            line: usize,
            begin_line: usize,
        },
        PropertyDrawerHeader {
            line: usize,
        },
        PropertyDrawerEnd {
            line: usize,
        },
        PropertyItem {
            line: usize,
            drawer: PropertyDrawer,
            entry: PropertyEntry,
        },
        PropertyDrawer {
            line: usize,
            drawer: PropertyDrawer,
        },
        Text {
            line: usize,
        },
    }

    impl Context {
        pub fn kind(&self) -> &'static str {
            match self {
                Context::Heading { .. } => "heading",
                Context::ListItem { .. } => "list-item",
                Context::Checkbox { .. } => "checkbox",
                Context::Table { .. } => "table",
                Context::CodeBlockHeader { .. } => "code-block-header",
                Context::CodeBlock { .. } => "code-block",
                Context::PropertyDrawerHeader { .. } => "property-drawer-header",
                Context::PropertyDrawerEnd { .. } => "property-drawer-end",
                Context::PropertyItem { .. } => "property-item",
                Context::PropertyDrawer { .. } => "property-drawer",
                Context::Text { .. } => "text",
            }
        }

        pub fn line(&self) -> usize {
            match self {
                Context::Heading { line, .. }
                | Context::ListItem { line, .. }
                | Context::Checkbox { line, .. }
                | Context::Table { line, .. }
                | Context::CodeBlockHeader { line, .. }
                | Context::CodeBlock { line, .. }
                | Context::PropertyDrawerHeader { line }
                | Context::PropertyDrawerEnd { line }
                | Context::PropertyItem { line, .. }
                | Context::PropertyDrawer { line, .. }
                | Context::Text { line } => *line,
            }
        }
    }

    /* ----------------------------- Block fences ----------------------------- */

    fn block_begin(i: &str) -> PResult<'_, (&str, &str)> {
        let (i, _) = space0(i)?;
        let (i, _) = tag_no_case("#+begin_")(i)?;
        let (i, name) = take_while1(|c: char| !c.is_whitespace())(i)?;
        Ok(("", (name, i.trim())))
    }

    /// Block name and parameters of a `#+BEGIN_NAME params` line.
    pub fn parse_block_begin(line: &str) -> Option<(String, String)> {
        block_begin(line)
            .ok()
            .map(|(_, (name, params))| (name.to_uppercase(), params.to_string()))
    }

    pub fn is_block_end(line: &str) -> bool {
        line.trim_start()
            .get(..6)
            .is_some_and(|p| p.eq_ignore_ascii_case("#+end_"))
    }

    /// Begin line of the terminated block containing `line`; the `#+END_` line counts
    /// as inside. Blocks never cross headings.
    pub fn code_block_containing(doc: &impl Document, line: usize) -> Option<usize> {
        let mut open = None;
        for n in 0..line.min(doc.line_count()) {
            let text = doc.line_at(n);
            if heading::level_of(text) > 0 {
                open = None;
            } else if open.is_some() {
                if is_block_end(text) {
                    open = None;
                }
            } else if parse_block_begin(text).is_some() {
                open = Some(n);
            }
        }
        let begin = open?;
        (line..doc.line_count())
            .take_while(|&n| heading::level_of(doc.line_at(n)) == 0)
            .find(|&n| is_block_end(doc.line_at(n)))?;
        Some(begin)
    }

    /* ---------------------------- Nested content ---------------------------- */

    /// Why the backward search for a list item owning a plain line stopped.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum NestedScanExit {
        Owner { line: usize, item: ListItem },
        /// `blank_run_limit` consecutive blank lines detach the text.
        BlankRun,
        Heading,
        /// First item met is not shallower than the text.
        NotAncestor,
        /// An unmatched `#+BEGIN_` above: the line sits inside a block.
        InsideBlock,
        /// A plain line at column zero ends every list above it.
        Unindented,
        StartOfDocument,
    }

    pub fn scan_nested_owner(
        doc: &impl Document,
        line: usize,
        config: &EditorConfig,
    ) -> NestedScanExit {
        let mut floor = indent_of(doc.line_at(line));
        let mut blanks = 0;
        let mut pending_ends = 0usize;
        for n in (0..line).rev() {
            let text = doc.line_at(n);
            if text.trim().is_empty() {
                blanks += 1;
                if blanks >= config.blank_run_limit {
                    return NestedScanExit::BlankRun;
                }
                continue;
            }
            blanks = 0;
            if heading::level_of(text) > 0 {
                return NestedScanExit::Heading;
            }
            if is_block_end(text) {
                pending_ends += 1;
                continue;
            }
            if parse_block_begin(text).is_some() {
                if pending_ends == 0 {
                    return NestedScanExit::InsideBlock;
                }
                pending_ends -= 1;
                continue;
            }
            if pending_ends > 0 {
                continue;
            }
            if let Some(item) = list::parse(text) {
                return if item.indent < floor {
                    NestedScanExit::Owner { line: n, item }
                } else {
                    NestedScanExit::NotAncestor
                };
            }
            floor = floor.min(indent_of(text));
            if floor == 0 {
                return NestedScanExit::Unindented;
            }
        }
        NestedScanExit::StartOfDocument
    }

    fn is_structural(text: &str) -> bool {
        heading::level_of(text) > 0
            || list::parse(text).is_some()
            || table::is_table_line(text)
            || property::is_drawer_start(text)
            || property::is_drawer_end(text)
            || parse_block_begin(text).is_some()
            || is_block_end(text)
    }

    fn list_context(line: usize, item: ListItem) -> Context {
        if item.checkbox.is_some() {
            Context::Checkbox { line, item }
        } else {
            Context::ListItem { line, item }
        }
    }

    /* ----------------------------- Classification ----------------------------- */

    pub fn analyze_context(doc: &impl Document, position: Position, config: &EditorConfig) -> Context {
        let position = clamp_position(doc, position);
        let context = classify(doc, position, config);
        debug!(
            line = position.line,
            character = position.character,
            kind = context.kind(),
            owner = context.line(),
            "classified cursor context"
        );
        context
    }

    fn classify(doc: &impl Document, position: Position, config: &EditorConfig) -> Context {
        let line = position.line;
        let text = doc.line_at(line);

        if let Some(heading) = heading::parse(text, &config.keywords) {
            return Context::Heading { line, heading };
        }
        if let Some((block, parameters)) = parse_block_begin(text) {
            return Context::CodeBlockHeader {
                line,
                block,
                parameters,
            };
        }
        if let Some(item) = list::parse(text) {
            return list_context(line, item);
        }
        if !text.trim().is_empty() && !is_structural(text) {
            match scan_nested_owner(doc, line, config) {
                NestedScanExit::Owner { line: owner, item } => return list_context(owner, item),
                exit => trace!(line, ?exit, "no owning list item"),
            }
        }
        if table::is_table_line(text) {
            return Context::Table {
                line,
                cells: table::parse_row(text),
                column: table::cell_index_at(text, position.character),
            };
        }
        if property::is_drawer_start(text) {
            return Context::PropertyDrawerHeader { line };
        }
        if property::is_drawer_end(text) {
            return Context::PropertyDrawerEnd { line };
        }
        let drawer = property::drawer_containing(doc, line);
        if let (Some(drawer), Some(entry)) = (drawer, property::parse_entry(text)) {
            return Context::PropertyItem {
                line,
                drawer,
                entry,
            };
        }
        if let Some(drawer) = drawer {
            return Context::PropertyDrawer { line, drawer };
        }
        if let Some(begin_line) = code_block_containing(doc, line) {
            return Context::CodeBlock { line, begin_line };
        }
        Context::Text { line }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::document::TextDocument;
        use crate::list::{Bullet, Checkbox};

        fn at(text: &str, line: usize, character: usize) -> Context {
            let doc = TextDocument::new(text);
            analyze_context(&doc, Position::new(line, character), &EditorConfig::default())
        }

        #[test]
        fn heading_with_keyword() {
            let Context::Heading { line, heading } = at("* TODO Task", 0, 3) else {
                panic!("expected heading");
            };
            assert_eq!(line, 0);
            assert_eq!(heading.level, 1);
            assert_eq!(heading.keyword.as_deref(), Some("TODO"));
            assert_eq!(heading.title, "Task");
        }

        #[test]
        fn indented_checkbox() {
            let Context::Checkbox { item, .. } = at("  - [ ] item", 0, 8) else {
                panic!("expected checkbox");
            };
            assert_eq!(item.indent, 2);
            assert_eq!(item.checkbox, Some(Checkbox::Empty));
            assert_eq!(item.checkbox.map(Checkbox::as_char), Some(' '));
        }

        #[test]
        fn drawer_markers_and_entries() {
            let text = "* H\n:PROPERTIES:\n:ID: x\nnot an entry\n:END:";
            assert_eq!(at(text, 1, 0).kind(), "property-drawer-header");
            assert!(matches!(
                at(text, 2, 1),
                Context::PropertyItem { entry, drawer, .. } if entry.key == "ID" && drawer.end_line == 4
            ));
            assert_eq!(at(text, 3, 0).kind(), "property-drawer");
            assert_eq!(at(text, 4, 0).kind(), "property-drawer-end");
            assert_eq!(at(":PROPERTIES:", 0, 0).kind(), "property-drawer-header");
        }

        #[test]
        fn entry_outside_a_drawer_is_text() {
            assert_eq!(at("* H\n:ID: x", 1, 0).kind(), "text");
        }

        #[test]
        fn nested_content_inherits_the_owner() {
            let ctx = at("- item\n  continued", 1, 4);
            assert!(matches!(ctx, Context::ListItem { line: 0, .. }));

            let ctx = at("1. first\n   - [X] sub\n     more", 2, 6);
            assert!(matches!(
                ctx,
                Context::Checkbox { line: 1, item } if item.checkbox == Some(Checkbox::Checked)
            ));

            let ctx = at("1) one\n\n   after one blank", 2, 3);
            assert!(matches!(
                ctx,
                Context::ListItem { line: 0, item } if item.bullet == Bullet::Ordered { number: 1, delimiter: ')' }
            ));
        }

        #[test]
        fn two_blank_lines_detach_text() {
            assert_eq!(at("- item\n\n\n  text", 3, 2).kind(), "text");
        }

        #[test]
        fn dedented_paragraph_ends_the_item() {
            assert_eq!(at("- item\ndedented\n  more", 2, 2).kind(), "text");
            // A column-zero line between the item and the text detaches the text,
            // even though the item itself is shallower than it.
            assert_eq!(at("- item\nflush\n  more", 2, 2).kind(), "text");
            assert!(matches!(
                scan_nested_owner(&TextDocument::new("- item\nflush\n  more"), 2, &EditorConfig::default()),
                NestedScanExit::Unindented
            ));
            assert_eq!(at("- item\nflush", 1, 0).kind(), "text");
            assert_eq!(at("  - deep\n  same level", 1, 3).kind(), "text");
        }

        #[test]
        fn code_blocks() {
            let text = "#+BEGIN_SRC rust :tangle yes\nfn main() {}\n#+end_src";
            assert!(matches!(
                at(text, 0, 0),
                Context::CodeBlockHeader { block, parameters, .. } if block == "SRC" && parameters == "rust :tangle yes"
            ));
            assert!(matches!(at(text, 1, 0), Context::CodeBlock { begin_line: 0, .. }));
            assert!(matches!(at(text, 2, 0), Context::CodeBlock { begin_line: 0, .. }));
            assert_eq!(at("#+begin_example\nstuff", 1, 0).kind(), "text");
        }

        #[test]
        fn blocks_inside_list_items() {
            let text = "- item\n  #+BEGIN_SRC sh\n  ls -l\n  #+END_SRC\n  after";
            assert!(matches!(at(text, 2, 3), Context::CodeBlock { begin_line: 1, .. }));
            assert!(matches!(at(text, 4, 3), Context::ListItem { line: 0, .. }));
        }

        #[test]
        fn table_cells() {
            let Context::Table { cells, column, .. } = at("| a | b |", 0, 5) else {
                panic!("expected table");
            };
            assert_eq!(cells, vec!["a".to_string(), "b".to_string()]);
            assert_eq!(column, Some(1));
        }

        #[test]
        fn positions_past_the_end_are_clamped() {
            assert_eq!(at("* H\nbody", 9, 40).line(), 1);
            assert_eq!(at("", 0, 0).kind(), "text");
        }

        #[test]
        fn context_serializes_with_a_kind_tag() {
            let json = serde_json::to_value(at("- [ ] x", 0, 0)).expect("json");
            assert_eq!(json["kind"], "checkbox");
            assert_eq!(json["item"]["indent"], 0);
        }
    }
}

pub mod engine {
    //! Turns a classified context and a command into one edit batch.

    use crate::context::{self, Context};
    use crate::core::*;
    use crate::heading::{self, Heading};
    use crate::list::{self, ListItem};
    use crate::table;
    use tracing::{debug, warn};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Command {
        /// `respect_content` places a new list item after the item's nested content
        /// instead of directly below its first line. Headings always skip their subtree.
        InsertSibling { respect_content: bool },
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

    /// What `execute` left for the host to do.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Outcome {
        Cursor(Position),
        Fold(LineSpan),
        Unchanged,
    }

    pub struct StructuralEditor<'a> {
        config: &'a EditorConfig,
    }

    impl<'a> StructuralEditor<'a> {
        pub fn new(config: &'a EditorConfig) -> Self {
            Self { config }
        }

        pub fn config(&self) -> &EditorConfig {
            self.config
        }

        /// Computes the whole batch for `command` against `doc` without touching it.
        pub fn plan(&self, doc: &impl Document, position: Position, command: Command) -> EditPlan {
            let position = clamp_position(doc, position);
            let context = context::analyze_context(doc, position, self.config);
            let plan = match &context {
                Context::Heading { line, heading } => {
                    self.on_heading(doc, position, *line, heading, command)
                }
                Context::ListItem { line, item } | Context::Checkbox { line, item } => {
                    self.on_list_item(doc, position, *line, item, command)
                }
                Context::Table { .. } => self.on_table(doc, position, command),
                Context::PropertyItem { .. } | Context::PropertyDrawer { .. } => {
                    self.on_property(doc, position, command)
                }
                Context::Text { .. } => self.on_text(doc, position, command),
                Context::CodeBlockHeader { .. }
                | Context::CodeBlock { .. }
                | Context::PropertyDrawerHeader { .. }
                | Context::PropertyDrawerEnd { .. } => match command {
                    Command::InsertSibling { .. } | Command::Split => newline_at(position),
                    _ => self.fallback(doc, position, command),
                },
            };
            let edits = match &plan {
                EditPlan::Apply(batch) => batch.edits.len(),
                _ => 0,
            };
            debug!(kind = context.kind(), ?command, edits, "planned structural edit");
            plan
        }

        /// Plans `command` and hands the batch to `host` in one call.
        pub fn execute<H: EditHost>(
            &self,
            host: &mut H,
            position: Position,
            command: Command,
        ) -> Result<Outcome, DomainError> {
            check_bounds(&*host, position)?;
            match self.plan(&*host, position, command) {
                EditPlan::Apply(batch) => {
                    if !batch.edits.is_empty() && !host.apply_edits(&batch.edits) {
                        warn!(?command, edits = batch.edits.len(), "host rejected edit batch");
                        return Err(DomainError::BatchRejected);
                    }
                    Ok(Outcome::Cursor(batch.cursor))
                }
                EditPlan::Fold(span) => Ok(Outcome::Fold(span)),
                EditPlan::Unchanged => Ok(Outcome::Unchanged),
            }
        }

        /* ------------------------------- Headings ------------------------------- */

        fn on_heading(
            &self,
            doc: &impl Document,
            position: Position,
            line: usize,
            heading: &Heading,
            command: Command,
        ) -> EditPlan {
            let level = heading.level;
            match command {
                Command::InsertSibling { .. } => {
                    let at = after_subtree(doc, line);
                    let text = heading::build(&Heading::new(level, ""));
                    apply(vec![insert_line(doc, at, text)], Position::new(at, level + 1))
                }
                Command::Split => split_heading(doc, position, line, level),
                Command::Promote => mutation(heading::promote(doc, line, self.config), position),
                Command::Demote => mutation(heading::demote(doc, line, self.config), position),
                Command::FoldOrIndent => {
                    let end = heading::find_subtree_end(doc, line);
                    if end > line {
                        EditPlan::Fold(LineSpan { start: line, end })
                    } else {
                        EditPlan::Unchanged
                    }
                }
                Command::CycleKeyword => self.cycle_keyword(doc, position, line),
                _ => EditPlan::Unchanged,
            }
        }

        fn cycle_keyword(&self, doc: &impl Document, position: Position, line: usize) -> EditPlan {
            let edits = heading::cycle_keyword(doc, line, &self.config.keywords)
                .into_iter()
                .collect();
            mutation(edits, position)
        }

        /* --------------------------------- Lists --------------------------------- */

        fn on_list_item(
            &self,
            doc: &impl Document,
            position: Position,
            line: usize,
            item: &ListItem,
            command: Command,
        ) -> EditPlan {
            let nested = position.line != line;
            match command {
                Command::InsertSibling { respect_content } => {
                    let at = if respect_content || nested {
                        list::find_list_item_end(doc, line, item.indent) + 1
                    } else {
                        line + 1
                    };
                    let (mut edits, text) = self.sibling_line(doc, line, item, at, "");
                    let cursor = Position::new(at, char_len(&text));
                    edits.push(insert_line(doc, at, text));
                    apply(edits, cursor)
                }
                Command::Split => self.split_item(doc, position, line, item),
                Command::Promote => {
                    mutation(list::shift_item(doc, line, -1, self.config), position)
                }
                Command::Demote => mutation(list::shift_item(doc, line, 1, self.config), position),
                Command::FoldOrIndent => {
                    let end = list::find_list_item_end(doc, line, item.indent);
                    if item.content.is_empty() && !list::has_sub_items(doc, line, item.indent) {
                        mutation(list::shift_item(doc, line, 1, self.config), position)
                    } else if end > line {
                        EditPlan::Fold(LineSpan { start: line, end })
                    } else {
                        EditPlan::Unchanged
                    }
                }
                Command::ToggleCheckbox => mutation(
                    list::toggle_checkbox(doc, line).into_iter().collect(),
                    position,
                ),
                Command::Renumber => mutation(list::renumber_run(doc, line, self.config), position),
                _ => self.fallback(doc, position, command),
            }
        }

        /// Text of a new sibling of `item` placed before snapshot line `at`, plus the
        /// marker edits keeping an ordered run sequential.
        fn sibling_line(
            &self,
            doc: &impl Document,
            anchor: usize,
            item: &ListItem,
            at: usize,
            content: &str,
        ) -> (Vec<TextEdit>, String) {
            let mut sibling = item.next_sibling();
            let mut edits = vec![];
            if let Some((number, renumbered)) =
                list::renumber_for_insert(doc, anchor, at, self.config)
            {
                sibling.bullet = sibling.bullet.with_number(number);
                edits = renumbered;
            }
            let prefix = list::build(&sibling);
            (edits, format!("{prefix}{content}"))
        }

        fn split_item(
            &self,
            doc: &impl Document,
            position: Position,
            line: usize,
            item: &ListItem,
        ) -> EditPlan {
            let nested = position.line != line;
            let text = doc.line_at(position.line);
            let content_col = if nested {
                indent_of(text)
            } else {
                list::content_start(text).unwrap_or(0)
            };

            if !nested && position.character <= content_col {
                let (mut edits, new_line) = self.sibling_line(doc, line, item, line, "");
                let cursor = Position::new(line, char_len(&new_line));
                edits.push(insert_line(doc, line, new_line));
                return apply(edits, cursor);
            }

            let at = if nested {
                list::find_list_item_end(doc, line, item.indent) + 1
            } else {
                line + 1
            };
            let cut = byte_offset(text, position.character);
            let tail = text[cut..].trim();
            let (mut edits, new_line) = self.sibling_line(doc, line, item, at, tail);
            let cursor = Position::new(at, char_len(&new_line) - char_len(tail));
            edits.push(cut_tail(text, position, content_col));
            edits.push(insert_line(doc, at, new_line));
            apply(edits, cursor)
        }

        /* -------------------------------- Tables -------------------------------- */

        fn on_table(&self, doc: &impl Document, position: Position, command: Command) -> EditPlan {
            let line = position.line;
            match command {
                Command::InsertSibling { .. } | Command::Split => {
                    let row = table::blank_row_like(doc.line_at(line));
                    let column = table::first_cell(&row).unwrap_or(0);
                    apply(
                        vec![insert_line(doc, line + 1, row)],
                        Position::new(line + 1, column),
                    )
                }
                Command::NextCell | Command::FoldOrIndent => next_cell(doc, position),
                Command::PreviousCell => previous_cell(doc, position),
                _ => self.fallback(doc, position, command),
            }
        }

        /* ------------------------------ Properties ------------------------------ */

        fn on_property(
            &self,
            doc: &impl Document,
            position: Position,
            command: Command,
        ) -> EditPlan {
            match command {
                Command::InsertSibling { .. } | Command::Split => {
                    let indent = indent_of(doc.line_at(position.line));
                    let at = position.line + 1;
                    let text = format!("{}:", " ".repeat(indent));
                    apply(vec![insert_line(doc, at, text)], Position::new(at, indent + 1))
                }
                _ => self.fallback(doc, position, command),
            }
        }

        /* --------------------------------- Text --------------------------------- */

        fn on_text(&self, doc: &impl Document, position: Position, command: Command) -> EditPlan {
            match command {
                Command::InsertSibling { .. } => {
                    match heading::find_current_heading(doc, position.line, &self.config.keywords)
                    {
                        Some((_, enclosing)) => {
                            let at = position.line + 1;
                            let text = heading::build(&Heading::new(enclosing.level, ""));
                            apply(
                                vec![insert_line(doc, at, text)],
                                Position::new(at, enclosing.level + 1),
                            )
                        }
                        None => newline_at(position),
                    }
                }
                Command::Split => newline_at(position),
                _ => self.fallback(doc, position, command),
            }
        }

        /// Commands that still mean something outside their home context.
        fn fallback(&self, doc: &impl Document, position: Position, command: Command) -> EditPlan {
            match command {
                Command::CycleKeyword => {
                    match heading::find_current_heading(doc, position.line, &self.config.keywords)
                    {
                        Some((line, _)) => self.cycle_keyword(doc, position, line),
                        None => EditPlan::Unchanged,
                    }
                }
                _ => EditPlan::Unchanged,
            }
        }
    }

    /* -------------------------------- Helpers -------------------------------- */

    fn check_bounds(doc: &impl Document, position: Position) -> Result<(), DomainError> {
        let line_count = doc.line_count();
        let in_bounds = position.line < line_count.max(1)
            && position.character <= char_len(doc.line_at(position.line));
        if in_bounds {
            Ok(())
        } else {
            Err(DomainError::PositionOutOfBounds {
                line: position.line,
                character: position.character,
                line_count,
            })
        }
    }

    fn apply(edits: Vec<TextEdit>, cursor: Position) -> EditPlan {
        EditPlan::Apply(EditBatch::new(edits, cursor))
    }

    /// Batch for in-place edits whose cursor follows the text it sits in.
    fn mutation(edits: Vec<TextEdit>, position: Position) -> EditPlan {
        if edits.is_empty() {
            return EditPlan::Unchanged;
        }
        let cursor = map_cursor(&edits, position);
        apply(edits, cursor)
    }

    fn newline_at(position: Position) -> EditPlan {
        apply(
            vec![TextEdit::insert(position, "\n")],
            Position::new(position.line + 1, 0),
        )
    }

    /// Where `position` ends up once single-line `edits` are applied; a cursor inside
    /// a replaced span is clamped into the replacement.
    fn map_cursor(edits: &[TextEdit], position: Position) -> Position {
        let col = position.character as isize;
        let shift: isize = edits
            .iter()
            .filter(|e| e.range.start.line == position.line && e.range.end.line == position.line)
            .map(|e| {
                let start = e.range.start.character as isize;
                let end = e.range.end.character as isize;
                let inserted = char_len(&e.new_text) as isize;
                if col >= end {
                    inserted - (end - start)
                } else if col > start {
                    (start + (col - start).min(inserted)) - col
                } else {
                    0
                }
            })
            .sum();
        Position::new(position.line, (col + shift).max(0) as usize)
    }

    fn after_subtree(doc: &impl Document, line: usize) -> usize {
        heading::last_content_line(doc, line, heading::find_subtree_end(doc, line)) + 1
    }

    /// Deletes the text right of the cursor together with the spaces before it,
    /// never reaching left of `floor`.
    fn cut_tail(text: &str, position: Position, floor: usize) -> TextEdit {
        let cut = byte_offset(text, position.character);
        let keep = char_len(text[..cut].trim_end()).max(floor).min(position.character);
        TextEdit::delete(Range::on_line(position.line, keep, char_len(text)))
    }

    fn split_heading(
        doc: &impl Document,
        position: Position,
        line: usize,
        level: usize,
    ) -> EditPlan {
        let text = doc.line_at(line);
        if position.character <= level {
            let stars = heading::build(&Heading::new(level, ""));
            return apply(
                vec![insert_line(doc, line, stars)],
                Position::new(line, level + 1),
            );
        }
        let cut = byte_offset(text, position.character);
        let tail = text[cut..].trim();
        let at = after_subtree(doc, line);
        let edits = vec![
            cut_tail(text, position, level + 1),
            insert_line(doc, at, heading::build(&Heading::new(level, tail))),
        ];
        apply(edits, Position::new(at, level + 1))
    }

    fn next_cell(doc: &impl Document, position: Position) -> EditPlan {
        if let Some(col) = table::find_next_cell(doc.line_at(position.line), position.character) {
            return EditPlan::Apply(EditBatch::cursor_only(Position::new(position.line, col)));
        }
        let rows = (position.line + 1..doc.line_count())
            .take_while(|&n| table::is_table_line(doc.line_at(n)));
        cursor_to_row(doc, rows, table::first_cell)
    }

    fn previous_cell(doc: &impl Document, position: Position) -> EditPlan {
        let line = position.line;
        if let Some(col) = table::find_previous_cell(doc.line_at(line), position.character) {
            return EditPlan::Apply(EditBatch::cursor_only(Position::new(line, col)));
        }
        let rows = (0..line)
            .rev()
            .take_while(|&n| table::is_table_line(doc.line_at(n)));
        cursor_to_row(doc, rows, table::last_cell)
    }

    /// Moves into the first non-separator row of `rows`, at the cell `pick` selects.
    fn cursor_to_row(
        doc: &impl Document,
        mut rows: impl Iterator<Item = usize>,
        pick: fn(&str) -> Option<usize>,
    ) -> EditPlan {
        rows.find(|&n| !table::is_separator_row(doc.line_at(n)))
            .and_then(|n| pick(doc.line_at(n)).map(|col| Position::new(n, col)))
            .map_or(EditPlan::Unchanged, |cursor| {
                EditPlan::Apply(EditBatch::cursor_only(cursor))
            })
    }

}

pub use context::{Context, analyze_context};
pub use crate::core::{DomainError, EditPlan, EditorConfig, KeywordSet, Position};
pub use document::TextDocument;
pub use engine::{Command, Outcome, StructuralEditor};
