//! Outliner engine: treats the list items of a plain-text document as a tree of blocks.
//! Modules keep the core pure: parsing, formatting and editing take explicit inputs
//! (text, time, scope) and hand back new values, while persistence and the host UI
//! reach the tree only through the `storage`, `view` and `bridges` seams.

pub mod core {
    use chrono::{DateTime, SubsecRound, Utc};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::collections::{BTreeSet, HashMap};
    use uuid::Uuid;

    /* ------------------------------- IDs ------------------------------- */

    const ID_LEN: usize = 6;
    const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    /// Block identity, written to disk as the trailing `^id` anchor.
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct BlockId(pub String);

    impl BlockId {
        /// Random six-character base-36 id. Callers that need uniqueness within a file
        /// go through [`OutlinerFile::next_id`].
        pub fn generate() -> Self {
            let mut n = Uuid::new_v4().as_u128();
            let mut s = String::with_capacity(ID_LEN);
            for _ in 0..ID_LEN {
                s.push(ID_ALPHABET[(n % 36) as usize] as char);
                n /= 36;
            }
            Self(s)
        }

        pub fn as_str(&self) -> &str {
            &self.0
        }

        /// Anchor tokens are ASCII alphanumerics and dashes.
        pub fn is_valid_anchor(s: &str) -> bool {
            !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        }
    }

    impl From<&str> for BlockId {
        fn from(s: &str) -> Self {
            Self(s.to_string())
        }
    }

    impl std::fmt::Display for BlockId {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(&self.0)
        }
    }

    /* ------------------------------ Markers ------------------------------ */

    /// List marker that introduced a block. Ordered numbering is re-derived on output.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub enum Marker {
        #[default]
        Dash,
        Star,
        Plus,
        Ordered {
            delimiter: char,
        },
    }

    impl Marker {
        /// Marker text for the sibling at `ordinal` (1-based).
        pub fn render(&self, ordinal: usize) -> String {
            match self {
                Marker::Dash => "-".to_string(),
                Marker::Star => "*".to_string(),
                Marker::Plus => "+".to_string(),
                Marker::Ordered { delimiter } => format!("{ordinal}{delimiter}"),
            }
        }
    }

    /* ------------------------------ Tasks ------------------------------ */

    pub const TODO_PREFIX: &str = "[ ] ";
    pub const DONE_PREFIX: &str = "[x] ";

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum TaskState {
        None,
        Todo,
        Done,
    }

    impl TaskState {
        /// Derived from the `[ ] ` / `[x] ` prefix of the first line.
        pub fn of(text: &str) -> Self {
            if text.starts_with(TODO_PREFIX) {
                TaskState::Todo
            } else if text.starts_with(DONE_PREFIX) || text.starts_with("[X] ") {
                TaskState::Done
            } else {
                TaskState::None
            }
        }
    }

    /* --------------------------- System metadata --------------------------- */

    /// Where the metadata tail sat relative to the block's children when parsed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub enum TailPlacement {
        #[default]
        Canonical,
        AfterChildren,
    }

    /// Per-block bookkeeping carried by the hidden tail line.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SystemMeta {
        pub created: DateTime<Utc>,
        pub updated: DateTime<Utc>,
        pub version: u64,
        /// Set when the values were read from a tail rather than synthesized.
        #[serde(skip)]
        pub system: bool,
        #[serde(skip)]
        pub placement: TailPlacement,
        /// Tail keys this version does not understand; re-emitted untouched.
        #[serde(default)]
        pub extra: IndexMap<String, String>,
    }

    impl SystemMeta {
        pub fn new(now: DateTime<Utc>) -> Self {
            let now = now.trunc_subsecs(0);
            Self {
                created: now,
                updated: now,
                version: 1,
                system: false,
                placement: TailPlacement::Canonical,
                extra: IndexMap::new(),
            }
        }

        /// Record a mutation.
        pub fn touch(&mut self, now: DateTime<Utc>) {
            self.updated = now.trunc_subsecs(0);
            self.version += 1;
        }

        fn same_values(&self, other: &Self) -> bool {
            self.created == other.created
                && self.updated == other.updated
                && self.version == other.version
                && self.extra == other.extra
        }
    }

    /* ------------------------------ Warnings ------------------------------ */

    /// Non-blocking validation findings attached while parsing.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub enum BlockWarning {
        /// A text line looks like document structure (heading, rule) outside a fence.
        StructuralText { line: usize },
        /// The anchor was already taken; the block received a fresh id.
        DuplicateId { original: BlockId },
    }

    impl BlockWarning {
        pub fn message(&self) -> String {
            match self {
                BlockWarning::StructuralText { line } => format!(
                    "line {} looks like document structure and is shown as plain text",
                    line + 1
                ),
                BlockWarning::DuplicateId { original } => {
                    format!("anchor ^{original} was used twice; a new id was assigned")
                }
            }
        }
    }

    /* ------------------------------ Entities ------------------------------ */

    /// A node of the outline. Children are stored by id in the file's arena.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Block {
        pub id: BlockId,
        /// Literal content; lines joined with `\n`.
        pub text: String,
        #[serde(default)]
        pub children: Vec<BlockId>,
        /// Display-only fold state; never written to disk.
        #[serde(skip)]
        pub collapsed: bool,
        #[serde(default)]
        pub marker: Marker,
        pub meta: SystemMeta,
        #[serde(skip)]
        pub warnings: Vec<BlockWarning>,
    }

    impl Block {
        pub fn new(id: BlockId, text: impl Into<String>, now: DateTime<Utc>) -> Self {
            Self {
                id,
                text: text.into(),
                children: vec![],
                collapsed: false,
                marker: Marker::default(),
                meta: SystemMeta::new(now),
                warnings: vec![],
            }
        }

        pub fn task_state(&self) -> TaskState {
            TaskState::of(&self.text)
        }

        pub fn first_line(&self) -> &str {
            self.text.lines().next().unwrap_or("")
        }

        /// Length in characters, the unit of every cursor offset.
        pub fn char_len(&self) -> usize {
            self.text.chars().count()
        }

        fn model_eq(&self, other: &Self) -> bool {
            self.id == other.id
                && self.text == other.text
                && self.children == other.children
                && self.marker == other.marker
                && self.meta.same_values(&other.meta)
        }
    }

    /* ------------------------------ Aggregate ------------------------------ */

    /// Aggregate root: one outline document.
    ///
    /// `blocks` is the arena and the source of truth together with `roots`; the parent
    /// index is derived and kept current by the structural helpers below.
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct OutlinerFile {
        /// Lines before the first block (front matter, headings), kept verbatim.
        #[serde(default)]
        pub preamble: Vec<String>,
        pub roots: Vec<BlockId>,
        pub blocks: IndexMap<BlockId, Block>,
        #[serde(skip)]
        parents: HashMap<BlockId, Option<BlockId>>,
        #[serde(skip)]
        retired: BTreeSet<BlockId>,
    }

    impl OutlinerFile {
        /// A file holding a single empty block.
        pub fn with_placeholder(now: DateTime<Utc>) -> Self {
            let mut file = Self::default();
            file.ensure_root(now);
            file
        }

        pub fn block(&self, id: &BlockId) -> Option<&Block> {
            self.blocks.get(id)
        }

        pub fn block_mut(&mut self, id: &BlockId) -> Option<&mut Block> {
            self.blocks.get_mut(id)
        }

        pub fn contains(&self, id: &BlockId) -> bool {
            self.blocks.contains_key(id)
        }

        pub fn len(&self) -> usize {
            self.blocks.len()
        }

        pub fn is_empty(&self) -> bool {
            self.blocks.is_empty()
        }

        /// Parent of `id`; `None` for roots and unknown ids.
        pub fn parent_of(&self, id: &BlockId) -> Option<&BlockId> {
            self.parents.get(id).and_then(|p| p.as_ref())
        }

        pub fn is_root(&self, id: &BlockId) -> bool {
            matches!(self.parents.get(id), Some(None))
        }

        /// Children of `parent`, or the roots when `parent` is `None`.
        pub fn siblings(&self, parent: Option<&BlockId>) -> &[BlockId] {
            match parent {
                None => &self.roots,
                Some(p) => self
                    .blocks
                    .get(p)
                    .map(|b| b.children.as_slice())
                    .unwrap_or(&[]),
            }
        }

        fn siblings_mut(&mut self, parent: Option<&BlockId>) -> Option<&mut Vec<BlockId>> {
            match parent {
                None => Some(&mut self.roots),
                Some(p) => self.blocks.get_mut(p).map(|b| &mut b.children),
            }
        }

        /// Position of `id` among its siblings.
        pub fn index_in_parent(&self, id: &BlockId) -> Option<usize> {
            let parent = self.parents.get(id)?;
            self.siblings(parent.as_ref()).iter().position(|s| s == id)
        }

        pub fn previous_sibling(&self, id: &BlockId) -> Option<&BlockId> {
            let ix = self.index_in_parent(id)?;
            let parent = self.parent_of(id);
            ix.checked_sub(1).and_then(|p| self.siblings(parent).get(p))
        }

        pub fn next_sibling(&self, id: &BlockId) -> Option<&BlockId> {
            let ix = self.index_in_parent(id)?;
            self.siblings(self.parent_of(id)).get(ix + 1)
        }

        /// Number of ancestors.
        pub fn depth(&self, id: &BlockId) -> usize {
            let mut depth = 0;
            let mut cur = self.parent_of(id);
            while let Some(p) = cur {
                depth += 1;
                cur = self.parent_of(p);
            }
            depth
        }

        /// True when `id` is `ancestor` or lies in its subtree.
        pub fn is_within(&self, id: &BlockId, ancestor: &BlockId) -> bool {
            let mut cur = Some(id);
            while let Some(c) = cur {
                if c == ancestor {
                    return true;
                }
                cur = self.parent_of(c);
            }
            false
        }

        /// True when `id` belongs to `scope` (the whole file when `scope` is `None`).
        pub fn in_scope(&self, id: &BlockId, scope: Option<&BlockId>) -> bool {
            self.contains(id) && scope.is_none_or(|root| self.is_within(id, root))
        }

        /// `id` followed by all of its descendants, pre-order.
        pub fn subtree(&self, id: &BlockId) -> Vec<BlockId> {
            let mut out = Vec::new();
            let mut stack = vec![id];
            while let Some(cur) = stack.pop() {
                let Some(block) = self.blocks.get(cur) else {
                    continue;
                };
                out.push(cur.clone());
                stack.extend(block.children.iter().rev());
            }
            out
        }

        /// Pre-order walk of the scope's content skipping children of collapsed blocks,
        /// paired with the depth relative to the scope.
        pub fn visible_rows(&self, scope: Option<&BlockId>) -> Vec<(BlockId, usize)> {
            let mut out = Vec::new();
            let mut stack: Vec<(&BlockId, usize)> =
                self.siblings(scope).iter().rev().map(|id| (id, 0)).collect();
            while let Some((id, depth)) = stack.pop() {
                let Some(block) = self.blocks.get(id) else {
                    continue;
                };
                out.push((id.clone(), depth));
                if !block.collapsed {
                    stack.extend(block.children.iter().rev().map(|c| (c, depth + 1)));
                }
            }
            out
        }

        /// Ids of [`Self::visible_rows`].
        pub fn visible_order(&self, scope: Option<&BlockId>) -> Vec<BlockId> {
            self.visible_rows(scope).into_iter().map(|(id, _)| id).collect()
        }

        /// Every block in document order, ignoring fold state.
        pub fn preorder(&self) -> Vec<BlockId> {
            let mut out = Vec::with_capacity(self.blocks.len());
            for root in &self.roots {
                out.extend(self.subtree(root));
            }
            out
        }

        /// Fresh id that is neither live nor retired in this file.
        pub fn next_id(&self) -> BlockId {
            loop {
                let id = BlockId::generate();
                if !self.blocks.contains_key(&id) && !self.retired.contains(&id) {
                    return id;
                }
            }
        }

        /// True when `id` is live or was removed earlier in this session.
        pub fn is_taken(&self, id: &BlockId) -> bool {
            self.blocks.contains_key(id) || self.retired.contains(id)
        }

        /* --------------------------- Structural edits --------------------------- */

        /// Add `block` to the arena and link it at `index` under `parent`.
        pub fn insert_block(&mut self, block: Block, parent: Option<&BlockId>, index: usize) {
            let id = block.id.clone();
            self.blocks.insert(id.clone(), block);
            self.attach(&id, parent, index);
        }

        /// Link an arena block at `index` (clamped) under `parent`.
        pub fn attach(&mut self, id: &BlockId, parent: Option<&BlockId>, index: usize) {
            let Some(siblings) = self.siblings_mut(parent) else {
                return;
            };
            let ix = index.min(siblings.len());
            siblings.insert(ix, id.clone());
            self.parents.insert(id.clone(), parent.cloned());
        }

        /// Unlink `id` from its sibling list, keeping it (and its subtree) in the arena.
        /// Returns the former parent and index.
        pub fn detach(&mut self, id: &BlockId) -> Option<(Option<BlockId>, usize)> {
            let parent = self.parents.get(id)?.clone();
            let siblings = self.siblings_mut(parent.as_ref())?;
            let ix = siblings.iter().position(|s| s == id)?;
            siblings.remove(ix);
            Some((parent, ix))
        }

        /// Remove a single block whose children have already been re-homed.
        pub fn remove_block(&mut self, id: &BlockId) -> Option<Block> {
            self.detach(id);
            self.parents.remove(id);
            let block = self.blocks.shift_remove(id)?;
            self.retired.insert(id.clone());
            Some(block)
        }

        /// Remove `id` and all of its descendants. Returns the removed ids.
        pub fn remove_subtree(&mut self, id: &BlockId) -> Vec<BlockId> {
            let ids = self.subtree(id);
            self.detach(id);
            for removed in &ids {
                self.parents.remove(removed);
                self.blocks.shift_remove(removed);
                self.retired.insert(removed.clone());
            }
            ids
        }

        /// Check that `id` may become a child of `new_parent`.
        pub fn check_move(
            &self,
            id: &BlockId,
            new_parent: Option<&BlockId>,
        ) -> Result<(), OutlinerError> {
            if !self.contains(id) {
                return Err(OutlinerError::UnknownBlock(id.clone()));
            }
            if let Some(target) = new_parent {
                if !self.contains(target) {
                    return Err(OutlinerError::UnknownBlock(target.clone()));
                }
                if self.is_within(target, id) {
                    return Err(OutlinerError::Cycle {
                        block: id.clone(),
                        target: target.clone(),
                    });
                }
            }
            Ok(())
        }

        /// Keep at least one root. Returns the placeholder id when one was created.
        pub fn ensure_root(&mut self, now: DateTime<Utc>) -> Option<BlockId> {
            if !self.roots.is_empty() {
                return None;
            }
            let id = self.next_id();
            self.insert_block(Block::new(id.clone(), "", now), None, 0);
            Some(id)
        }

        /// Rebuild the parent index from `roots` and the children lists.
        pub fn reindex(&mut self) {
            self.parents.clear();
            let mut stack: Vec<(BlockId, Option<BlockId>)> =
                self.roots.iter().map(|r| (r.clone(), None)).collect();
            while let Some((id, parent)) = stack.pop() {
                if let Some(block) = self.blocks.get(&id) {
                    for child in &block.children {
                        stack.push((child.clone(), Some(id.clone())));
                    }
                }
                self.parents.insert(id, parent);
            }
        }

        /// Check arena/index consistency: every linked id exists exactly once.
        pub fn validate(&self) -> Result<(), OutlinerError> {
            let mut seen = BTreeSet::new();
            let mut stack: Vec<&BlockId> = self.roots.iter().collect();
            while let Some(id) = stack.pop() {
                let block = self
                    .blocks
                    .get(id)
                    .ok_or_else(|| OutlinerError::UnknownBlock(id.clone()))?;
                if !seen.insert(id) {
                    return Err(OutlinerError::SharedBlock(id.clone()));
                }
                stack.extend(block.children.iter());
            }
            if let Some(orphan) = self.blocks.keys().find(|id| !seen.contains(id)) {
                return Err(OutlinerError::Orphan(orphan.clone()));
            }
            Ok(())
        }

        /// Equality of everything that is persisted: ids, text, shape, markers and
        /// metadata values. Fold state, warnings and parse bookkeeping are ignored.
        pub fn model_eq(&self, other: &Self) -> bool {
            self.preamble == other.preamble
                && self.roots == other.roots
                && self.blocks.len() == other.blocks.len()
                && self
                    .blocks
                    .iter()
                    .all(|(id, b)| other.blocks.get(id).is_some_and(|o| b.model_eq(o)))
        }

        /// Blocks carrying warnings, in document order.
        pub fn warnings(&self) -> Vec<(&BlockId, &BlockWarning)> {
            let mut out = Vec::new();
            for id in self.preorder() {
                if let Some((key, block)) = self.blocks.get_key_value(&id) {
                    out.extend(block.warnings.iter().map(|w| (key, w)));
                }
            }
            out
        }
    }

    /* ------------------------------ Selection ------------------------------ */

    /// Cursor/selection instruction produced by edits and consumed by the view.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Selection {
        Caret { block: BlockId, offset: usize },
        Text { block: BlockId, anchor: usize, head: usize },
        Blocks { anchor: BlockId, head: BlockId },
    }

    impl Selection {
        pub fn caret(block: &BlockId, offset: usize) -> Self {
            Selection::Caret {
                block: block.clone(),
                offset,
            }
        }
    }

    /// Byte index of the `offset`-th character, clamped to the end of `text`.
    pub fn byte_offset(text: &str, offset: usize) -> usize {
        text.char_indices()
            .nth(offset)
            .map(|(ix, _)| ix)
            .unwrap_or(text.len())
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum OutlinerError {
        #[error("unknown block `{0}`")]
        UnknownBlock(BlockId),
        #[error("block `{0}` is linked from more than one parent")]
        SharedBlock(BlockId),
        #[error("block `{0}` is not reachable from any root")]
        Orphan(BlockId),
        #[error("moving `{block}` under `{target}` would make it its own descendant")]
        Cycle { block: BlockId, target: BlockId },
        #[error("malformed metadata tail: {0}")]
        InvalidTail(String),
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn now() -> DateTime<Utc> {
            DateTime::parse_from_rfc3339("2026-10-17T09:00:00Z")
                .unwrap()
                .with_timezone(&Utc)
        }

        fn sample() -> OutlinerFile {
            let mut file = OutlinerFile::default();
            file.insert_block(Block::new("a".into(), "a", now()), None, 0);
            file.insert_block(Block::new("b".into(), "b", now()), None, 1);
            file.insert_block(Block::new("c".into(), "c", now()), Some(&"a".into()), 0);
            file
        }

        #[test]
        fn generated_ids_are_anchor_safe() {
            let id = BlockId::generate();
            assert_eq!(id.as_str().len(), 6);
            assert!(BlockId::is_valid_anchor(id.as_str()));
        }

        #[test]
        fn removed_ids_are_never_reissued() {
            let mut file = sample();
            file.remove_subtree(&"a".into());
            assert!(!file.contains(&"c".into()));
            assert!(file.is_taken(&"a".into()));
            assert!(file.is_taken(&"c".into()));
            assert!(file.parent_of(&"c".into()).is_none());
            file.validate().expect("consistent");
        }

        #[test]
        fn visible_rows_skip_collapsed_children() {
            let mut file = sample();
            assert_eq!(
                file.visible_order(None),
                vec![BlockId::from("a"), "c".into(), "b".into()]
            );
            file.block_mut(&"a".into()).unwrap().collapsed = true;
            assert_eq!(file.visible_order(None), vec![BlockId::from("a"), "b".into()]);
            assert_eq!(file.visible_order(Some(&"a".into())), vec![BlockId::from("c")]);
        }

        #[test]
        fn check_move_rejects_cycles() {
            let file = sample();
            let err = file
                .check_move(&"a".into(), Some(&"c".into()))
                .expect_err("cycle");
            assert!(matches!(err, OutlinerError::Cycle { .. }));
            assert!(file.check_move(&"c".into(), Some(&"b".into())).is_ok());
        }

        #[test]
        fn last_root_is_replaced_by_placeholder() {
            let mut file = sample();
            file.remove_subtree(&"a".into());
            file.remove_subtree(&"b".into());
            let placeholder = file.ensure_root(now()).expect("placeholder");
            assert_eq!(file.roots, vec![placeholder.clone()]);
            assert_eq!(file.block(&placeholder).unwrap().text, "");
        }

        #[test]
        fn task_state_reads_first_line_prefix() {
            assert_eq!(TaskState::of("[ ] todo"), TaskState::Todo);
            assert_eq!(TaskState::of("[x] done"), TaskState::Done);
            assert_eq!(TaskState::of("[X] done"), TaskState::Done);
            assert_eq!(TaskState::of("plain [ ]"), TaskState::None);
        }
    }
}

pub mod parser {
    //! Outline parser built on `nom`.
    //!
    //! Parsing strategy:
    //! - The scan is line-oriented; each line is classified with `nom` combinators
    //!   (list marker, metadata tail, anchor).
    //! - A stack of open blocks keyed by marker column builds the tree.
    //! - A fence opened by a block swallows every following line verbatim until it closes.
    //! - Nothing here fails: anomalies become warnings on the block that owns them.

    use super::core::*;
    use super::storage::OutlineParser;
    use anyhow::{Context, Result};
    use chrono::{DateTime, Utc};
    use indexmap::IndexMap;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_while1},
        character::complete::{char, digit1, one_of, space0, space1},
        combinator::{eof, map, opt, value},
        error::VerboseError,
        multi::many0,
        sequence::{pair, preceded, separated_pair, terminated, tuple},
    };
    use std::{fs, path::Path};

    pub const TAB_WIDTH: usize = 4;
    pub const TAIL_OPEN: &str = "%%sys";
    pub const TAIL_CLOSE: &str = "%%";

    /* ------------------------ Public entry points ------------------------ */

    /// Parse a document, stamping blocks without a tail with the current time.
    pub fn parse_outline(input: &str) -> OutlinerFile {
        parse_outline_at(input, Utc::now())
    }

    /// Parse a document; `now` seeds metadata for blocks that carry no tail.
    pub fn parse_outline_at(input: &str, now: DateTime<Utc>) -> OutlinerFile {
        let mut builder = TreeBuilder::default();
        for line in input.lines() {
            builder.push_line(line);
        }
        builder.finish(now)
    }

    /// Concrete parser implementing the `storage::OutlineParser` trait.
    pub struct NomOutlineParser;

    impl OutlineParser for NomOutlineParser {
        fn parse_file(&self, abs_path: &Path) -> Result<OutlinerFile> {
            let text =
                fs::read_to_string(abs_path).with_context(|| format!("reading {:?}", abs_path))?;
            Ok(parse_outline(&text))
        }
    }

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /* --------------------------- Line grammar --------------------------- */

    /// A line that starts a block.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) struct MarkerLine<'a> {
        pub column: usize,
        pub marker: Marker,
        /// Width of the marker as written (`-` is 1, `12.` is 3).
        pub marker_width: usize,
        /// First text line: everything after the single separating space.
        pub rest: &'a str,
    }

    fn list_marker(i: &str) -> PResult<'_, Marker> {
        alt((
            value(Marker::Dash, char('-')),
            value(Marker::Star, char('*')),
            value(Marker::Plus, char('+')),
            map(pair(digit1, one_of(".)")), |(_, delimiter)| Marker::Ordered {
                delimiter,
            }),
        ))(i)
    }

    /// Leading whitespace as (columns, bytes), tabs advancing to the next stop.
    pub(crate) fn indentation(line: &str) -> (usize, usize) {
        let mut columns = 0;
        let mut bytes = 0;
        for c in line.chars() {
            match c {
                ' ' => columns += 1,
                '\t' => columns += TAB_WIDTH - columns % TAB_WIDTH,
                _ => break,
            }
            bytes += c.len_utf8();
        }
        (columns, bytes)
    }

    /// Remove up to `columns` columns of leading whitespace.
    pub(crate) fn strip_columns(line: &str, columns: usize) -> &str {
        let mut consumed = 0;
        let mut bytes = 0;
        for c in line.chars() {
            if consumed >= columns {
                break;
            }
            match c {
                ' ' => consumed += 1,
                '\t' => consumed += TAB_WIDTH - consumed % TAB_WIDTH,
                _ => break,
            }
            bytes += c.len_utf8();
        }
        &line[bytes..]
    }

    pub(crate) fn marker_line(line: &str) -> Option<MarkerLine<'_>> {
        let (column, ws) = indentation(line);
        let body = &line[ws..];
        let (after, marker) = list_marker(body).ok()?;
        let marker_width = body.len() - after.len();
        let rest = if after.is_empty() {
            after
        } else if let Some(r) = after.strip_prefix(' ') {
            r
        } else {
            after.strip_prefix('\t')?
        };
        Some(MarkerLine {
            column,
            marker,
            marker_width,
            rest,
        })
    }

    /// Fence opener as (fence char, run length).
    pub(crate) fn fence_open(content: &str) -> Option<(char, usize)> {
        let t = content.trim_start();
        let c = t.chars().next().filter(|c| *c == '`' || *c == '~')?;
        let run = t.chars().take_while(|x| *x == c).count();
        if run < 3 {
            return None;
        }
        // A backtick fence's info string cannot contain backticks.
        if c == '`' && t[run..].contains('`') {
            return None;
        }
        Some((c, run))
    }

    pub(crate) fn closes_fence(line: &str, (c, len): (char, usize)) -> bool {
        let t = line.trim_start();
        let run = t.chars().take_while(|x| *x == c).count();
        run >= len && t[run..].trim().is_empty()
    }

    /// ATX headings and thematic breaks: markup that would read as document structure.
    pub(crate) fn looks_structural(content: &str) -> bool {
        let t = content.trim();
        let hashes = t.chars().take_while(|c| *c == '#').count();
        if (1..=6).contains(&hashes) {
            let after = &t[hashes..];
            if after.is_empty() || after.starts_with(' ') {
                return true;
            }
        }
        let compact: String = t.chars().filter(|c| !c.is_whitespace()).collect();
        compact.len() >= 3
            && ['-', '*', '_']
                .iter()
                .any(|m| compact.chars().all(|c| c == *m))
    }

    /* --------------------------- Metadata tail --------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) struct Tail {
        pub meta: SystemMeta,
        pub anchor: Option<BlockId>,
    }

    fn is_key_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || c == '_' || c == '-'
    }

    fn anchor_token(i: &str) -> PResult<'_, &str> {
        preceded(
            char('^'),
            take_while1(|c: char| c.is_ascii_alphanumeric() || c == '-'),
        )(i)
    }

    fn tail_fields(i: &str) -> PResult<'_, (Vec<(&str, &str)>, Option<&str>)> {
        let field = separated_pair(
            take_while1(is_key_char),
            char('='),
            take_while1(|c: char| !c.is_whitespace() && c != '%'),
        );
        map(
            tuple((
                tag(TAIL_OPEN),
                many0(preceded(space1, field)),
                space0,
                tag(TAIL_CLOSE),
                opt(preceded(space1, anchor_token)),
                terminated(space0, eof),
            )),
            |(_, fields, _, _, anchor, _)| (fields, anchor),
        )(i)
    }

    /// `None` when the line is not a tail at all; `Some(Err)` when it starts like one
    /// but cannot be read, in which case the caller keeps it as text.
    pub(crate) fn parse_tail(
        content: &str,
        now: DateTime<Utc>,
    ) -> Option<std::result::Result<Tail, OutlinerError>> {
        let content = content.trim();
        if !content.starts_with(TAIL_OPEN) {
            return None;
        }
        let (_, (fields, anchor)) = match tail_fields(content) {
            Ok(parsed) => parsed,
            Err(_) => return Some(Err(OutlinerError::InvalidTail(content.to_string()))),
        };
        Some(tail_from_fields(fields, anchor, now))
    }

    /// Continuation text that would otherwise open a block or read as a tail.
    pub(crate) fn needs_escape(line: &str) -> bool {
        marker_line(line).is_some()
            || matches!(parse_tail(line, DateTime::<Utc>::MIN_UTC), Some(Ok(_)))
            || unescape_line(line).is_some()
    }

    /// Drops one leading backslash when what follows it needed escaping. Text that
    /// merely starts with a backslash stays as written.
    pub(crate) fn unescape_line(line: &str) -> Option<String> {
        let lead = line.len() - line.trim_start().len();
        let rest = line[lead..].strip_prefix('\\')?;
        let candidate = format!("{}{rest}", &line[..lead]);
        needs_escape(&candidate).then_some(candidate)
    }

    fn tail_from_fields(
        fields: Vec<(&str, &str)>,
        anchor: Option<&str>,
        now: DateTime<Utc>,
    ) -> std::result::Result<Tail, OutlinerError> {
        let mut meta = SystemMeta::new(now);
        meta.system = true;
        let mut extra = IndexMap::new();
        for (key, raw) in fields {
            match key {
                "v" => {
                    meta.version = raw
                        .parse()
                        .map_err(|_| OutlinerError::InvalidTail(format!("version {raw:?}")))?;
                }
                "created" => meta.created = parse_time(raw)?,
                "updated" => meta.updated = parse_time(raw)?,
                _ => {
                    extra.insert(key.to_string(), raw.to_string());
                }
            }
        }
        meta.extra = extra;
        Ok(Tail {
            meta,
            anchor: anchor.map(BlockId::from),
        })
    }

    fn parse_time(raw: &str) -> std::result::Result<DateTime<Utc>, OutlinerError> {
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| OutlinerError::InvalidTail(format!("timestamp {raw:?}")))
    }

    /// Split a trailing ` ^anchor` off a text line.
    pub(crate) fn split_anchor(line: &str) -> Option<(&str, BlockId)> {
        let caret = line.rfind('^')?;
        let (head, token) = line.split_at(caret);
        if !(head.is_empty() || head.ends_with(char::is_whitespace)) {
            return None;
        }
        let (rest, id) = anchor_token(token).ok()?;
        if !rest.trim().is_empty() {
            return None;
        }
        Some((head.trim_end(), BlockId::from(id)))
    }

    /* ------------------------------ Tree build ------------------------------ */

    #[derive(Debug, Default)]
    struct Draft {
        marker: Marker,
        lines: Vec<String>,
        tail: Option<Tail>,
        tail_after_children: bool,
        children: Vec<usize>,
        structural_lines: Vec<usize>,
        /// Line index where the last fence closed (or `usize::MAX` while open).
        fenced_until: Option<usize>,
    }

    #[derive(Debug, Clone, Copy)]
    struct Open {
        draft: usize,
        column: usize,
        content_column: usize,
    }

    #[derive(Debug, Clone, Copy)]
    struct Fence {
        owner: usize,
        fence: (char, usize),
        strip: usize,
    }

    #[derive(Debug)]
    struct PendingTail {
        owner: usize,
        /// Index into the owner's lines at the time the tail was read.
        line: usize,
        raw: String,
        after_children: bool,
    }

    #[derive(Debug, Default)]
    struct TreeBuilder {
        preamble: Vec<String>,
        drafts: Vec<Draft>,
        roots: Vec<usize>,
        stack: Vec<Open>,
        fence: Option<Fence>,
        // Tails are resolved against `now` only at the end.
        pending_tails: Vec<PendingTail>,
    }

    impl TreeBuilder {
        fn push_line(&mut self, line: &str) {
            if let Some(fence) = self.fence {
                let draft = &mut self.drafts[fence.owner];
                draft.lines.push(strip_columns(line, fence.strip).to_string());
                if closes_fence(line, fence.fence) {
                    draft.fenced_until = Some(draft.lines.len() - 1);
                    self.fence = None;
                }
                return;
            }

            if let Some(m) = marker_line(line) {
                self.open_block(m);
                return;
            }

            let Some(innermost) = self.stack.last().copied() else {
                self.preamble.push(line.to_string());
                return;
            };

            if line.trim().is_empty() {
                self.drafts[innermost.draft].lines.push(String::new());
                return;
            }

            // Deepest open block whose marker sits left of this line; otherwise the line
            // is a lazy continuation of the innermost block.
            let (column, _) = indentation(line);
            let owner_pos = self
                .stack
                .iter()
                .rposition(|open| open.column < column)
                .unwrap_or(self.stack.len() - 1);
            self.stack.truncate(owner_pos + 1);
            let owner = self.stack[owner_pos];
            let content = strip_columns(line, owner.content_column);
            let draft = &mut self.drafts[owner.draft];

            if content.trim_start().starts_with(TAIL_OPEN) {
                self.pending_tails.push(PendingTail {
                    owner: owner.draft,
                    line: draft.lines.len(),
                    raw: content.to_string(),
                    after_children: !draft.children.is_empty(),
                });
                // Keep the line's position so a malformed tail can fall back to text.
                draft.lines.push(content.to_string());
                return;
            }

            let content = match unescape_line(content) {
                Some(text) => text,
                None => content.to_string(),
            };
            if let Some(fence) = fence_open(&content) {
                draft.fenced_until = Some(usize::MAX);
                self.fence = Some(Fence {
                    owner: owner.draft,
                    fence,
                    strip: owner.content_column,
                });
            } else if looks_structural(&content) {
                draft.structural_lines.push(draft.lines.len());
            }
            draft.lines.push(content);
        }

        fn open_block(&mut self, m: MarkerLine<'_>) {
            while self.stack.last().is_some_and(|open| open.column >= m.column) {
                self.stack.pop();
            }
            let index = self.drafts.len();
            self.drafts.push(Draft {
                marker: m.marker,
                lines: vec![m.rest.to_string()],
                ..Draft::default()
            });
            match self.stack.last() {
                Some(parent) => self.drafts[parent.draft].children.push(index),
                None => self.roots.push(index),
            }
            let content_column = m.column + m.marker_width + 1;
            self.stack.push(Open {
                draft: index,
                column: m.column,
                content_column,
            });
            if let Some(fence) = fence_open(m.rest) {
                self.drafts[index].fenced_until = Some(usize::MAX);
                self.fence = Some(Fence {
                    owner: index,
                    fence,
                    strip: content_column,
                });
            }
        }

        fn finish(mut self, now: DateTime<Utc>) -> OutlinerFile {
            // An unterminated fence is closed so the tail written after it stays visible.
            if let Some(fence) = self.fence.take() {
                let (c, len) = fence.fence;
                let draft = &mut self.drafts[fence.owner];
                draft.lines.push(std::iter::repeat_n(c, len).collect());
                draft.fenced_until = Some(draft.lines.len() - 1);
            }
            self.resolve_tails(now);

            let mut file = OutlinerFile::default();
            file.preamble = self.preamble;

            // Ids first, in document order, so the earliest anchor wins on duplicates.
            let mut ids: Vec<BlockId> = Vec::with_capacity(self.drafts.len());
            let mut warnings: Vec<Vec<BlockWarning>> = Vec::with_capacity(self.drafts.len());
            let mut taken = std::collections::HashSet::new();
            for draft in &mut self.drafts {
                trim_trailing_blank(&mut draft.lines);
                let mut found = draft.tail.as_ref().and_then(|t| t.anchor.clone());
                if found.is_none() && draft.fenced_until.is_none() {
                    if let Some(last) = draft.lines.last_mut() {
                        if let Some((head, id)) = split_anchor(last) {
                            let head = head.to_string();
                            *last = head;
                            found = Some(id);
                        }
                    }
                }
                let mut block_warnings: Vec<BlockWarning> = draft
                    .structural_lines
                    .iter()
                    .map(|line| BlockWarning::StructuralText { line: *line })
                    .collect();
                let id = match found {
                    Some(id) if taken.insert(id.clone()) => id,
                    Some(original) => {
                        tracing::debug!(%original, "duplicate anchor, assigning a fresh id");
                        block_warnings.push(BlockWarning::DuplicateId { original });
                        fresh_id(&mut taken)
                    }
                    None => fresh_id(&mut taken),
                };
                ids.push(id);
                warnings.push(block_warnings);
            }

            for (index, (draft, block_warnings)) in
                self.drafts.into_iter().zip(warnings).enumerate()
            {
                let mut meta = match draft.tail {
                    Some(tail) => tail.meta,
                    None => SystemMeta::new(now),
                };
                if draft.tail_after_children {
                    meta.placement = TailPlacement::AfterChildren;
                }
                let block = Block {
                    id: ids[index].clone(),
                    text: draft.lines.join("\n"),
                    children: draft.children.iter().map(|c| ids[*c].clone()).collect(),
                    collapsed: false,
                    marker: draft.marker,
                    meta,
                    warnings: block_warnings,
                };
                file.blocks.insert(block.id.clone(), block);
            }
            file.roots = self.roots.iter().map(|r| ids[*r].clone()).collect();
            file.reindex();
            file.ensure_root(now);
            file
        }

        /// Turn recorded tail lines into metadata, dropping them from the text. The
        /// first readable tail of a block wins; later ones are discarded.
        fn resolve_tails(&mut self, now: DateTime<Utc>) {
            // Lines removed so far per block; pending tails arrive in line order.
            let mut removed = vec![0usize; self.drafts.len()];
            for PendingTail {
                owner,
                line,
                raw,
                after_children,
            } in std::mem::take(&mut self.pending_tails)
            {
                let draft = &mut self.drafts[owner];
                let pos = line - removed[owner];
                if draft.lines.get(pos) != Some(&raw) {
                    continue;
                }
                match parse_tail(&raw, now) {
                    Some(Ok(tail)) => {
                        draft.lines.remove(pos);
                        removed[owner] += 1;
                        shift_after(&mut draft.structural_lines, pos);
                        if draft.tail.is_none() {
                            draft.tail = Some(tail);
                            draft.tail_after_children = after_children;
                        } else {
                            tracing::debug!("dropping a second metadata tail");
                        }
                    }
                    Some(Err(err)) => {
                        tracing::debug!(%err, "keeping unreadable tail as text");
                    }
                    None => {}
                }
            }
        }
    }

    fn shift_after(lines: &mut [usize], removed: usize) {
        for line in lines.iter_mut() {
            if *line > removed {
                *line -= 1;
            }
        }
    }

    fn trim_trailing_blank(lines: &mut Vec<String>) {
        while lines.len() > 1 && lines.last().is_some_and(|l| l.trim().is_empty()) {
            lines.pop();
        }
    }

    fn fresh_id(taken: &mut std::collections::HashSet<BlockId>) -> BlockId {
        loop {
            let id = BlockId::generate();
            if taken.insert(id.clone()) {
                return id;
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn at() -> DateTime<Utc> {
            DateTime::parse_from_rfc3339("2026-10-17T09:00:00Z")
                .unwrap()
                .with_timezone(&Utc)
        }

        fn texts(file: &OutlinerFile) -> Vec<(usize, String)> {
            file.preorder()
                .iter()
                .map(|id| (file.depth(id), file.block(id).unwrap().text.clone()))
                .collect()
        }

        #[test]
        fn marker_lines_build_nested_blocks() {
            let file = parse_outline_at("- a\n\t- b\n\t\t- c\n\t- d\n- e\n", at());
            assert_eq!(
                texts(&file),
                vec![
                    (0, "a".to_string()),
                    (1, "b".to_string()),
                    (2, "c".to_string()),
                    (1, "d".to_string()),
                    (0, "e".to_string()),
                ]
            );
            file.validate().expect("consistent tree");
        }

        #[test]
        fn continuation_lines_join_block_text() {
            let file = parse_outline_at("- first\n  second\n\n  third\n- next\n", at());
            let first = file.block(&file.roots[0]).unwrap();
            assert_eq!(first.text, "first\nsecond\n\nthird");
            assert_eq!(file.roots.len(), 2);
        }

        #[test]
        fn tail_sets_identity_and_metadata() {
            let input = "- hello\n  %%sys v=4 created=2026-01-01T00:00:00Z updated=2026-02-01T00:00:00Z mood=calm%% ^abc123\n";
            let file = parse_outline_at(input, at());
            let block = file.block(&"abc123".into()).expect("anchored block");
            assert_eq!(block.text, "hello");
            assert_eq!(block.meta.version, 4);
            assert!(block.meta.system);
            assert_eq!(block.meta.extra.get("mood").map(String::as_str), Some("calm"));
            assert_eq!(block.meta.placement, TailPlacement::Canonical);
        }

        #[test]
        fn legacy_tail_after_children_belongs_to_parent() {
            let input = "- parent\n\t- child\n  %%sys v=2 created=2026-01-01T00:00:00Z updated=2026-01-01T00:00:00Z%% ^par001\n";
            let file = parse_outline_at(input, at());
            let parent = file.block(&"par001".into()).expect("parent keeps tail");
            assert_eq!(parent.text, "parent");
            assert_eq!(parent.children.len(), 1);
            assert_eq!(parent.meta.placement, TailPlacement::AfterChildren);
            let child = file.block(&parent.children[0]).unwrap();
            assert_eq!(child.text, "child");
        }

        #[test]
        fn fence_on_marker_line_keeps_content_verbatim() {
            let input = "- ```md\n  - not a child\n  # not a heading\n  ```\n- after\n";
            let file = parse_outline_at(input, at());
            assert_eq!(file.roots.len(), 2);
            let block = file.block(&file.roots[0]).unwrap();
            assert_eq!(block.text, "```md\n- not a child\n# not a heading\n```");
            assert!(block.children.is_empty());
            assert!(block.warnings.is_empty());
        }

        #[test]
        fn structural_text_is_flagged_not_split() {
            let file = parse_outline_at("- item\n  # heading inside\n  ---\n", at());
            assert_eq!(file.len(), 1);
            let block = file.block(&file.roots[0]).unwrap();
            assert_eq!(block.text, "item\n# heading inside\n---");
            assert_eq!(
                block.warnings,
                vec![
                    BlockWarning::StructuralText { line: 1 },
                    BlockWarning::StructuralText { line: 2 }
                ]
            );
        }

        #[test]
        fn trailing_anchor_is_adopted_without_tail() {
            let file = parse_outline_at("- referenced text ^ref-1\n", at());
            let block = file.block(&"ref-1".into()).expect("anchor adopted");
            assert_eq!(block.text, "referenced text");
            assert!(!block.meta.system);
        }

        #[test]
        fn duplicate_anchor_gets_fresh_id_and_warning() {
            let file = parse_outline_at("- one ^dup\n- two ^dup\n", at());
            assert_eq!(file.len(), 2);
            let second = file.block(&file.roots[1]).unwrap();
            assert_ne!(second.id, BlockId::from("dup"));
            assert!(matches!(
                second.warnings.as_slice(),
                [BlockWarning::DuplicateId { .. }]
            ));
        }

        #[test]
        fn preamble_and_empty_documents() {
            let file = parse_outline_at("---\ntitle: x\n---\n- a\n", at());
            assert_eq!(file.preamble, vec!["---", "title: x", "---"]);
            assert_eq!(file.roots.len(), 1);

            let empty = parse_outline_at("", at());
            assert_eq!(empty.roots.len(), 1);
            assert_eq!(empty.block(&empty.roots[0]).unwrap().text, "");
        }

        #[test]
        fn malformed_tail_stays_text() {
            let file = parse_outline_at("- a\n  %%sys v=oops%%\n", at());
            let block = file.block(&file.roots[0]).unwrap();
            assert_eq!(block.text, "a\n%%sys v=oops%%");
        }

        #[test]
        fn tail_is_taken_from_its_own_line() {
            let tail = "%%sys v=3 created=2026-01-01T00:00:00Z updated=2026-01-01T00:00:00Z%% ^abc";
            let input = format!("- code\n  ```\n  {tail}\n  ```\n  {tail}\n");
            let file = parse_outline_at(&input, at());
            let block = file.block(&BlockId::from("abc")).expect("anchored block");
            assert_eq!(block.text, format!("code\n```\n{tail}\n```"));
            assert_eq!(block.meta.version, 3);
        }

        #[test]
        fn escaped_lines_lose_one_backslash() {
            let file = parse_outline_at("- a\n  \\- b\n  \\\\- c\n  \\d\n", at());
            assert_eq!(file.len(), 1);
            let block = file.block(&file.roots[0]).unwrap();
            assert_eq!(block.text, "a\n- b\n\\- c\n\\d");
        }

        #[test]
        fn ordered_markers_and_tasks() {
            let file = parse_outline_at("1. [ ] first\n2) [x] second\n", at());
            let first = file.block(&file.roots[0]).unwrap();
            assert_eq!(first.marker, Marker::Ordered { delimiter: '.' });
            assert_eq!(first.task_state(), TaskState::Todo);
            let second = file.block(&file.roots[1]).unwrap();
            assert_eq!(second.marker, Marker::Ordered { delimiter: ')' });
            assert_eq!(second.task_state(), TaskState::Done);
        }

        #[test]
        fn marker_grammar() {
            assert!(marker_line("-").is_some());
            assert!(marker_line("  * item").is_some());
            assert!(marker_line("---").is_none());
            assert!(marker_line("**bold**").is_none());
            assert_eq!(marker_line("\t12. x").map(|m| (m.column, m.marker_width)), Some((4, 3)));
        }
    }
}

pub mod format {
    use super::core::*;
    use super::parser::{TAIL_CLOSE, TAIL_OPEN, closes_fence, fence_open, needs_escape};
    use chrono::{DateTime, SecondsFormat, Utc};
    use indexmap::IndexMap;
    use std::ops::Range;

    /// Byte spans of each block (with its subtree) in the written text.
    type Spans = IndexMap<BlockId, Range<usize>>;

    /// Output knobs. Everything else about the layout is fixed.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct FormatOptions {
        /// One nesting level; a tab unless the settings say otherwise.
        pub indent: String,
    }

    impl Default for FormatOptions {
        fn default() -> Self {
            Self {
                indent: "\t".to_string(),
            }
        }
    }

    pub fn format_outline(file: &OutlinerFile) -> String {
        format_outline_with(file, &FormatOptions::default())
    }

    pub fn format_outline_with(file: &OutlinerFile, options: &FormatOptions) -> String {
        let mut out = String::new();
        for line in &file.preamble {
            out.push_str(line);
            out.push('\n');
        }
        format_siblings(&mut out, file, &file.roots, 0, options, None);
        out
    }

    /// Line range (0-based, end exclusive) of every block and its subtree in the
    /// canonical text, keyed by anchor. Hosts use it to embed a block elsewhere.
    pub fn anchor_index(
        file: &OutlinerFile,
        options: &FormatOptions,
    ) -> IndexMap<BlockId, Range<usize>> {
        let mut out = String::new();
        for line in &file.preamble {
            out.push_str(line);
            out.push('\n');
        }
        let mut spans = Spans::new();
        format_siblings(&mut out, file, &file.roots, 0, options, Some(&mut spans));

        let newlines: Vec<usize> = out.match_indices('\n').map(|(at, _)| at).collect();
        let line_of = |byte: usize| newlines.partition_point(|&at| at < byte);
        spans
            .into_iter()
            .map(|(id, span)| (id, line_of(span.start)..line_of(span.end)))
            .collect()
    }

    /// Serialize the given blocks (with their subtrees) as a standalone fragment, each
    /// listed block at depth zero. Blocks nested under another listed block are skipped.
    pub fn format_blocks(file: &OutlinerFile, ids: &[BlockId], options: &FormatOptions) -> String {
        let tops: Vec<BlockId> = ids
            .iter()
            .filter(|id| {
                !ids
                    .iter()
                    .any(|other| other != *id && file.is_within(id, other))
            })
            .cloned()
            .collect();
        let mut out = String::new();
        format_siblings(&mut out, file, &tops, 0, options, None);
        out
    }

    fn format_siblings(
        out: &mut String,
        file: &OutlinerFile,
        ids: &[BlockId],
        depth: usize,
        options: &FormatOptions,
        mut spans: Option<&mut Spans>,
    ) {
        let mut ordinal = 0;
        for id in ids {
            let Some(block) = file.block(id) else {
                continue;
            };
            ordinal = match block.marker {
                Marker::Ordered { .. } => ordinal + 1,
                _ => 0,
            };
            format_block(
                out,
                file,
                block,
                depth,
                ordinal.max(1),
                options,
                spans.as_deref_mut(),
            );
        }
    }

    fn format_block(
        out: &mut String,
        file: &OutlinerFile,
        block: &Block,
        depth: usize,
        ordinal: usize,
        options: &FormatOptions,
        mut spans: Option<&mut Spans>,
    ) {
        let start = out.len();
        let indent = options.indent.repeat(depth);
        let marker = block.marker.render(ordinal);
        let continuation = format!("{indent}{}", " ".repeat(marker.chars().count() + 1));

        let mut lines = block.text.split('\n');
        let first = lines.next().unwrap_or("");
        out.push_str(&indent);
        out.push_str(&marker);
        if !first.is_empty() {
            out.push(' ');
            out.push_str(first);
        }
        out.push('\n');

        let mut fence = fence_open(first);
        for line in lines {
            match fence {
                Some(open) => {
                    push_line(out, &continuation, line);
                    if closes_fence(line, open) {
                        fence = None;
                    }
                }
                None => {
                    fence = fence_open(line);
                    if fence.is_some() {
                        push_line(out, &continuation, line);
                    } else if line.trim().is_empty() {
                        out.push('\n');
                    } else {
                        push_line(out, &continuation, &escape_line(line));
                    }
                }
            }
        }
        // The tail must never land inside an open fence.
        if let Some((c, len)) = fence {
            let close: String = std::iter::repeat_n(c, len).collect();
            push_line(out, &continuation, &close);
        }

        push_line(out, &continuation, &render_tail(&block.id, &block.meta));
        format_siblings(
            out,
            file,
            &block.children,
            depth + 1,
            options,
            spans.as_deref_mut(),
        );
        if let Some(spans) = spans {
            spans.insert(block.id.clone(), start..out.len());
        }
    }

    fn push_line(out: &mut String, prefix: &str, line: &str) {
        out.push_str(prefix);
        out.push_str(line);
        out.push('\n');
    }

    /// Backslash-escape a continuation line that would otherwise re-parse as a list
    /// marker or a metadata tail.
    pub fn escape_line(line: &str) -> String {
        let lead = line.len() - line.trim_start().len();
        if needs_escape(line) {
            format!("{}\\{}", &line[..lead], &line[lead..])
        } else {
            line.to_string()
        }
    }

    pub fn render_tail(id: &BlockId, meta: &SystemMeta) -> String {
        let mut s = format!(
            "{TAIL_OPEN} v={} created={} updated={}",
            meta.version,
            timestamp(&meta.created),
            timestamp(&meta.updated)
        );
        for (key, value) in &meta.extra {
            s.push(' ');
            s.push_str(key);
            s.push('=');
            s.push_str(value);
        }
        s.push_str(TAIL_CLOSE);
        s.push_str(" ^");
        s.push_str(id.as_str());
        s
    }

    fn timestamp(t: &DateTime<Utc>) -> String {
        t.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::parser::parse_outline_at;

        fn at() -> DateTime<Utc> {
            DateTime::parse_from_rfc3339("2026-10-17T09:00:00Z")
                .unwrap()
                .with_timezone(&Utc)
        }

        fn stable(input: &str) {
            let first = parse_outline_at(input, at());
            let written = format_outline(&first);
            let second = parse_outline_at(&written, at());
            assert!(first.model_eq(&second), "model drifted:\n{written}");
            assert_eq!(format_outline(&second), written);
        }

        #[test]
        fn canonical_layout() {
            let file = parse_outline_at("- a\n  more\n\t- b ^bbb\n", at());
            let out = format_outline(&file);
            let a = &file.roots[0];
            assert_eq!(
                out,
                format!(
                    "- a\n  more\n  %%sys v=1 created=2026-10-17T09:00:00Z updated=2026-10-17T09:00:00Z%% ^{a}\n\
                     \t- b\n\t  %%sys v=1 created=2026-10-17T09:00:00Z updated=2026-10-17T09:00:00Z%% ^bbb\n"
                )
            );
        }

        #[test]
        fn round_trips_are_stable() {
            stable("# Title\n\n- a\n  continued\n\t- b\n\t\t- c\n- d\n");
            stable("1. one\n1. two\n\t* nested\n+ plus\n");
            stable("- ```\n  - inside fence\n  ```\n- tail\n");
            stable("- lazy\ncontinuation\n- [ ] task\n");
            stable("- legacy\n\t- kid\n  %%sys v=7 created=2026-01-01T00:00:00Z updated=2026-01-02T00:00:00Z x=1%% ^leg001\n");
            stable("- open fence\n  ~~~\n  never closed\n");
            stable("- heading below\n  ## h2\n");
        }

        #[test]
        fn ordered_numbering_is_rederived() {
            let file = parse_outline_at("3. a\n7. b\n- c\n9) d\n", at());
            let out = format_outline(&file);
            let markers: Vec<&str> = out
                .lines()
                .filter(|l| !l.trim_start().starts_with("%%"))
                .map(|l| l.split(' ').next().unwrap_or(""))
                .collect();
            assert_eq!(markers, vec!["1.", "2.", "-", "1)"]);
        }

        #[test]
        fn marker_like_text_is_escaped() {
            let mut file = parse_outline_at("- a\n", at());
            let id = file.roots[0].clone();
            file.block_mut(&id).unwrap().text = "a\n- not a child\n%%sys v=1%%".to_string();
            let out = format_outline(&file);
            assert!(out.contains("\n  \\- not a child\n"));
            assert!(out.contains("\n  \\%%sys v=1%%\n"));
            let back = parse_outline_at(&out, at());
            assert_eq!(back.len(), 1);
            assert_eq!(back.block(&id).unwrap().text, "a\n- not a child\n%%sys v=1%%");
            assert_eq!(format_outline(&back), out);
        }

        #[test]
        fn fragment_skips_nested_duplicates() {
            let file = parse_outline_at("- a ^aaa\n\t- b ^bbb\n- c ^ccc\n", at());
            let ids = vec![BlockId::from("aaa"), "bbb".into(), "ccc".into()];
            let out = format_blocks(&file, &ids, &FormatOptions::default());
            assert_eq!(out.matches("^bbb").count(), 1);
            assert!(out.starts_with("- a\n"));
        }

        #[test]
        fn anchor_index_covers_subtrees() {
            let file = parse_outline_at("intro\n- a ^a\n\t- b ^b\n- c ^c\n", at());
            let index = anchor_index(&file, &FormatOptions::default());
            assert_eq!(index[&BlockId::from("a")], 1..5);
            assert_eq!(index[&BlockId::from("b")], 3..5);
            assert_eq!(index[&BlockId::from("c")], 5..7);
        }

        #[test]
        fn space_indent_option() {
            let file = parse_outline_at("- a\n\t- b\n", at());
            let options = FormatOptions {
                indent: "    ".to_string(),
            };
            let out = format_outline_with(&file, &options);
            assert!(out.contains("\n    - b\n"));
            let back = parse_outline_at(&out, at());
            assert!(file.model_eq(&back));
        }
    }
}

pub mod config {
    //! User settings. Every field has a default so a partial JSON file is enough.

    use anyhow::{Context, Result};
    use serde::{Deserialize, Serialize};
    use serde_with::{DurationMilliSeconds, serde_as};
    use std::{fs, path::Path, time::Duration};

    /// Id under which the outliner's own commands and menu items are registered.
    pub const FIRST_PARTY_ID: &str = "outliner";

    #[serde_as]
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Settings {
        /// Quiet period after the last edit before the file is written.
        #[serde_as(as = "DurationMilliSeconds<u64>")]
        pub debounce: Duration,
        /// Delay before retrying a failed write.
        #[serde_as(as = "DurationMilliSeconds<u64>")]
        pub retry_backoff: Duration,
        /// One nesting level in the written file.
        pub indent: String,
        pub row_height: f32,
        /// Rows rendered beyond each edge of the viewport.
        pub buffer_rows: usize,
        /// Horizontal offset per depth level, in pixels.
        pub indent_width: f32,
        /// Extra x distance past a row's indentation that turns "after" into "inside".
        pub inside_threshold: f32,
        pub drag_start_distance: f32,
        /// Clicks are ignored for this long after a drop.
        #[serde_as(as = "DurationMilliSeconds<u64>")]
        pub click_cooldown: Duration,
        pub bridges_enabled: bool,
        pub allowed_extensions: Vec<String>,
    }

    impl Default for Settings {
        fn default() -> Self {
            Self {
                debounce: Duration::from_millis(800),
                retry_backoff: Duration::from_millis(2000),
                indent: "\t".to_string(),
                row_height: 28.0,
                buffer_rows: 10,
                indent_width: 24.0,
                inside_threshold: 24.0,
                drag_start_distance: 4.0,
                click_cooldown: Duration::from_millis(300),
                bridges_enabled: false,
                allowed_extensions: Vec::new(),
            }
        }
    }

    impl Settings {
        pub fn load(path: &Path) -> Result<Self> {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading settings {:?}", path))?;
            Self::from_json(&raw).with_context(|| format!("parsing settings {:?}", path))
        }

        pub fn from_json(raw: &str) -> Result<Self> {
            Ok(serde_json::from_str(raw)?)
        }

        /// First-party commands always pass; others need the bridges switch and a listing.
        pub fn allows(&self, extension: &str) -> bool {
            extension == FIRST_PARTY_ID
                || (self.bridges_enabled && self.allowed_extensions.iter().any(|e| e == extension))
        }

        pub fn format_options(&self) -> crate::format::FormatOptions {
            crate::format::FormatOptions {
                indent: self.indent.clone(),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::io::Write;

        #[test]
        fn partial_json_keeps_defaults() {
            let settings =
                Settings::from_json(r#"{ "debounce": 250, "allowed_extensions": ["tasks"] }"#)
                    .expect("settings");
            assert_eq!(settings.debounce, Duration::from_millis(250));
            assert_eq!(settings.indent, "\t");
            assert_eq!(settings.allowed_extensions, vec!["tasks"]);
        }

        #[test]
        fn allow_list_needs_bridges_enabled() {
            let mut settings = Settings {
                allowed_extensions: vec!["tasks".to_string()],
                ..Settings::default()
            };
            assert!(settings.allows(FIRST_PARTY_ID));
            assert!(!settings.allows("tasks"));
            settings.bridges_enabled = true;
            assert!(settings.allows("tasks"));
            assert!(!settings.allows("other"));
        }

        #[test]
        fn load_reports_bad_files() {
            let mut tmp = tempfile::NamedTempFile::new().expect("tmp");
            write!(tmp, "{{ \"row_height\": \"tall\" }}").expect("write");
            let err = Settings::load(tmp.path()).expect_err("type mismatch");
            assert!(format!("{err:#}").contains("parsing settings"));
        }
    }
}

pub mod edit {
    //! Edit-command engine.
    //!
    //! Every operation takes a snapshot and returns a new one; the input is never
    //! touched. `None` means the gesture does nothing in the current state.
    //! Offsets are character offsets into the block text.

    use super::core::*;
    use super::parser::marker_line;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeSet;

    /// Ambient inputs of an edit: the zoom scope and the clock.
    #[derive(Debug, Clone, Copy)]
    pub struct EditContext<'a> {
        pub scope: Option<&'a BlockId>,
        pub now: DateTime<Utc>,
    }

    impl<'a> EditContext<'a> {
        pub fn new(scope: Option<&'a BlockId>, now: DateTime<Utc>) -> Self {
            Self { scope, now }
        }
    }

    #[derive(Debug, Clone)]
    pub struct EditOutcome {
        pub file: OutlinerFile,
        /// Blocks whose persisted form changed, removed ones included.
        pub dirty: BTreeSet<BlockId>,
        pub selection: Option<Selection>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum PasteMode {
        /// One block per non-blank line.
        Split,
        /// Raw text into the current block.
        Literal,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub enum EditCommand {
        SetText { block: BlockId, text: String },
        Split { block: BlockId, offset: usize },
        MergeForward { block: BlockId },
        MergeBackward { block: BlockId },
        Indent { block: BlockId },
        Outdent { block: BlockId },
        InsertAfter { block: BlockId },
        Delete { block: BlockId },
        RemoveSubtree { block: BlockId },
        Paste { block: BlockId, offset: usize, text: String, mode: PasteMode },
        ToggleTaskMarker { block: BlockId },
        ToggleTaskStatus { block: BlockId },
        ReparentMove { block: BlockId, parent: Option<BlockId>, index: usize },
        MoveUp { block: BlockId },
        MoveDown { block: BlockId },
    }

    impl EditCommand {
        /// The block the gesture was issued on.
        pub fn block(&self) -> &BlockId {
            match self {
                EditCommand::SetText { block, .. }
                | EditCommand::Split { block, .. }
                | EditCommand::MergeForward { block }
                | EditCommand::MergeBackward { block }
                | EditCommand::Indent { block }
                | EditCommand::Outdent { block }
                | EditCommand::InsertAfter { block }
                | EditCommand::Delete { block }
                | EditCommand::RemoveSubtree { block }
                | EditCommand::Paste { block, .. }
                | EditCommand::ToggleTaskMarker { block }
                | EditCommand::ToggleTaskStatus { block }
                | EditCommand::ReparentMove { block, .. }
                | EditCommand::MoveUp { block }
                | EditCommand::MoveDown { block } => block,
            }
        }
    }

    pub fn apply(
        file: &OutlinerFile,
        command: &EditCommand,
        ctx: EditContext<'_>,
    ) -> Option<EditOutcome> {
        let outcome = match command {
            EditCommand::SetText { block, text } => set_text(file, block, text, ctx),
            EditCommand::Split { block, offset } => split(file, block, *offset, ctx),
            EditCommand::MergeForward { block } => merge_forward(file, block, ctx),
            EditCommand::MergeBackward { block } => merge_backward(file, block, ctx),
            EditCommand::Indent { block } => indent(file, block, ctx),
            EditCommand::Outdent { block } => outdent(file, block, ctx),
            EditCommand::InsertAfter { block } => insert_after(file, block, ctx),
            EditCommand::Delete { block } => delete(file, block, ctx),
            EditCommand::RemoveSubtree { block } => remove_subtree(file, block, ctx),
            EditCommand::Paste {
                block,
                offset,
                text,
                mode,
            } => paste(file, block, *offset, text, *mode, ctx),
            EditCommand::ToggleTaskMarker { block } => toggle_task_marker(file, block, ctx),
            EditCommand::ToggleTaskStatus { block } => toggle_task_status(file, block, ctx),
            EditCommand::ReparentMove {
                block,
                parent,
                index,
            } => reparent_move(file, block, parent.as_ref(), *index, ctx),
            EditCommand::MoveUp { block } => move_up(file, block, ctx),
            EditCommand::MoveDown { block } => move_down(file, block, ctx),
        };
        if outcome.is_none() {
            tracing::trace!(?command, "edit is a no-op");
        }
        outcome
    }

    /* ------------------------------ Helpers ------------------------------ */

    /// Working copy of a snapshot plus the dirty set collected so far.
    struct Draft {
        file: OutlinerFile,
        dirty: BTreeSet<BlockId>,
        now: DateTime<Utc>,
    }

    impl Draft {
        fn new(file: &OutlinerFile, ctx: EditContext<'_>) -> Self {
            Self {
                file: file.clone(),
                dirty: BTreeSet::new(),
                now: ctx.now,
            }
        }

        fn text(&self, id: &BlockId) -> Option<&str> {
            self.file.block(id).map(|b| b.text.as_str())
        }

        fn set_text(&mut self, id: &BlockId, text: String) {
            if let Some(block) = self.file.block_mut(id) {
                block.text = text;
            }
            self.touch(id);
        }

        fn touch(&mut self, id: &BlockId) {
            if let Some(block) = self.file.block_mut(id) {
                block.meta.touch(self.now);
                self.dirty.insert(id.clone());
            }
        }

        fn new_block(&mut self, text: impl Into<String>, marker: Marker) -> Block {
            let id = self.file.next_id();
            self.dirty.insert(id.clone());
            Block {
                marker,
                ..Block::new(id, text, self.now)
            }
        }

        fn remove(&mut self, id: &BlockId) -> Option<Block> {
            let block = self.file.remove_block(id)?;
            self.dirty.insert(id.clone());
            Some(block)
        }

        /// Keeps the one-root rule; returns the placeholder if one was needed.
        fn ensure_root(&mut self) -> Option<BlockId> {
            let placeholder = self.file.ensure_root(self.now)?;
            self.dirty.insert(placeholder.clone());
            Some(placeholder)
        }

        fn done(self, selection: Option<Selection>) -> Option<EditOutcome> {
            Some(EditOutcome {
                file: self.file,
                dirty: self.dirty,
                selection,
            })
        }
    }

    /// A block the gesture may act on: present, inside the scope, and not the scope root.
    fn editable(file: &OutlinerFile, id: &BlockId, scope: Option<&BlockId>) -> bool {
        file.in_scope(id, scope) && scope != Some(id)
    }

    fn char_count(s: &str) -> usize {
        s.chars().count()
    }

    /// Strip list markers and indentation from a pasted line.
    fn paste_line(line: &str) -> &str {
        let trimmed = line.trim();
        match marker_line(trimmed) {
            Some(m) => m.rest.trim_start(),
            None => trimmed,
        }
    }

    /// Re-link `children` (already detached from their old parent) under `parent`,
    /// starting at `index`.
    fn relink(file: &mut OutlinerFile, children: &[BlockId], parent: &BlockId, index: usize) {
        for (k, child) in children.iter().enumerate() {
            file.attach(child, Some(parent), index.saturating_add(k));
        }
    }

    /* ----------------------------- Operations ----------------------------- */

    pub fn set_text(
        file: &OutlinerFile,
        id: &BlockId,
        text: &str,
        ctx: EditContext<'_>,
    ) -> Option<EditOutcome> {
        if file.block(id)?.text == text {
            return None;
        }
        let mut draft = Draft::new(file, ctx);
        draft.set_text(id, text.to_string());
        draft.done(None)
    }

    pub fn split(
        file: &OutlinerFile,
        id: &BlockId,
        offset: usize,
        ctx: EditContext<'_>,
    ) -> Option<EditOutcome> {
        if !editable(file, id, ctx.scope) {
            return None;
        }
        let mut draft = Draft::new(file, ctx);
        let block = draft.file.block(id)?;
        let marker = block.marker;
        let at = byte_offset(&block.text, offset);
        let (head, tail) = block.text.split_at(at);
        let (head, tail) = (head.to_string(), tail.to_string());

        let parent = draft.file.parent_of(id).cloned();
        let index = draft.file.index_in_parent(id)?;
        draft.set_text(id, head);
        let new_block = draft.new_block(tail, marker);
        let new_id = new_block.id.clone();
        draft.file.insert_block(new_block, parent.as_ref(), index + 1);
        draft.done(Some(Selection::caret(&new_id, 0)))
    }

    pub fn merge_forward(
        file: &OutlinerFile,
        id: &BlockId,
        ctx: EditContext<'_>,
    ) -> Option<EditOutcome> {
        if !editable(file, id, ctx.scope) {
            return None;
        }
        let order = file.visible_order(ctx.scope);
        let pos = order.iter().position(|o| o == id)?;
        let next = order.get(pos + 1)?.clone();

        let mut draft = Draft::new(file, ctx);
        let splice_at = if draft.file.parent_of(&next) == Some(id) {
            draft.file.index_in_parent(&next)
        } else {
            None
        };
        let join = char_count(draft.text(id)?);
        let absorbed = draft.remove(&next)?;
        let merged = format!("{}{}", draft.text(id)?, absorbed.text);
        draft.set_text(id, merged);
        let index = splice_at.unwrap_or(usize::MAX);
        relink(&mut draft.file, &absorbed.children, id, index);
        draft.done(Some(Selection::caret(id, join)))
    }

    pub fn merge_backward(
        file: &OutlinerFile,
        id: &BlockId,
        ctx: EditContext<'_>,
    ) -> Option<EditOutcome> {
        if !editable(file, id, ctx.scope) {
            return None;
        }
        let (target, splice_at) = match file.previous_sibling(id) {
            Some(prev) => (prev.clone(), None),
            None => {
                let parent = file.parent_of(id)?;
                if ctx.scope == Some(parent) {
                    return None;
                }
                (parent.clone(), file.index_in_parent(id))
            }
        };

        let mut draft = Draft::new(file, ctx);
        let join = char_count(draft.text(&target)?);
        let absorbed = draft.remove(id)?;
        let merged = format!("{}{}", draft.text(&target)?, absorbed.text);
        draft.set_text(&target, merged);
        relink(
            &mut draft.file,
            &absorbed.children,
            &target,
            splice_at.unwrap_or(usize::MAX),
        );
        draft.done(Some(Selection::caret(&target, join)))
    }

    pub fn indent(file: &OutlinerFile, id: &BlockId, ctx: EditContext<'_>) -> Option<EditOutcome> {
        if !editable(file, id, ctx.scope) {
            return None;
        }
        let prev = file.previous_sibling(id)?.clone();
        let mut draft = Draft::new(file, ctx);
        draft.file.detach(id)?;
        draft.file.attach(id, Some(&prev), usize::MAX);
        if let Some(block) = draft.file.block_mut(&prev) {
            block.collapsed = false;
        }
        draft.touch(id);
        draft.done(None)
    }

    pub fn outdent(file: &OutlinerFile, id: &BlockId, ctx: EditContext<'_>) -> Option<EditOutcome> {
        if !editable(file, id, ctx.scope) {
            return None;
        }
        let parent = file.parent_of(id)?.clone();
        if ctx.scope == Some(&parent) {
            return None;
        }
        let grandparent = file.parent_of(&parent).cloned();
        let parent_index = file.index_in_parent(&parent)?;
        let mut draft = Draft::new(file, ctx);
        draft.file.detach(id)?;
        draft.file.attach(id, grandparent.as_ref(), parent_index + 1);
        draft.touch(id);
        draft.done(None)
    }

    pub fn insert_after(
        file: &OutlinerFile,
        id: &BlockId,
        ctx: EditContext<'_>,
    ) -> Option<EditOutcome> {
        if !editable(file, id, ctx.scope) {
            return None;
        }
        let marker = file.block(id)?.marker;
        let parent = file.parent_of(id).cloned();
        let index = file.index_in_parent(id)?;
        let mut draft = Draft::new(file, ctx);
        let block = draft.new_block("", marker);
        let new_id = block.id.clone();
        draft.file.insert_block(block, parent.as_ref(), index + 1);
        draft.done(Some(Selection::caret(&new_id, 0)))
    }

    /// Backspace/delete on an empty leaf. Anything with content needs
    /// [`remove_subtree`] after the user confirms.
    pub fn delete(file: &OutlinerFile, id: &BlockId, ctx: EditContext<'_>) -> Option<EditOutcome> {
        if !editable(file, id, ctx.scope) {
            return None;
        }
        let block = file.block(id)?;
        if !block.text.is_empty() || !block.children.is_empty() {
            return None;
        }
        let order = file.visible_order(ctx.scope);
        let selection = caret_after_removal(file, &order, id);
        let mut draft = Draft::new(file, ctx);
        draft.remove(id)?;
        let selection = match draft.ensure_root() {
            Some(placeholder) => Some(Selection::caret(&placeholder, 0)),
            None => selection,
        };
        draft.done(selection)
    }

    pub fn remove_subtree(
        file: &OutlinerFile,
        id: &BlockId,
        ctx: EditContext<'_>,
    ) -> Option<EditOutcome> {
        if !editable(file, id, ctx.scope) {
            return None;
        }
        let order = file.visible_order(ctx.scope);
        let selection = caret_after_removal(file, &order, id);
        let mut draft = Draft::new(file, ctx);
        let removed = draft.file.remove_subtree(id);
        draft.dirty.extend(removed);
        let selection = match draft.ensure_root() {
            Some(placeholder) => Some(Selection::caret(&placeholder, 0)),
            None => selection,
        };
        draft.done(selection)
    }

    /// Start of the next visible block outside the removed subtree, else the end of
    /// the previous one.
    fn caret_after_removal(
        file: &OutlinerFile,
        order: &[BlockId],
        id: &BlockId,
    ) -> Option<Selection> {
        let pos = order.iter().position(|o| o == id)?;
        if let Some(next) = order[pos + 1..].iter().find(|o| !file.is_within(o, id)) {
            return Some(Selection::caret(next, 0));
        }
        let prev = order[..pos].last()?;
        let end = file.block(prev).map(Block::char_len).unwrap_or(0);
        Some(Selection::caret(prev, end))
    }

    pub fn paste(
        file: &OutlinerFile,
        id: &BlockId,
        offset: usize,
        text: &str,
        mode: PasteMode,
        ctx: EditContext<'_>,
    ) -> Option<EditOutcome> {
        if !editable(file, id, ctx.scope) {
            return None;
        }
        let normalized = text.replace("\r\n", "\n");
        let current = &file.block(id)?.text;
        let at = byte_offset(current, offset);
        let (head, rest) = current.split_at(at);

        let lines: Vec<&str> = match mode {
            PasteMode::Literal => vec![normalized.as_str()],
            PasteMode::Split => normalized
                .lines()
                .map(paste_line)
                .filter(|l| !l.is_empty())
                .collect(),
        };
        let (first, more) = lines.split_first()?;

        let mut draft = Draft::new(file, ctx);
        if more.is_empty() {
            draft.set_text(id, format!("{head}{first}{rest}"));
            return draft.done(Some(Selection::caret(id, offset + char_count(first))));
        }

        let marker = file.block(id)?.marker;
        let parent = file.parent_of(id).cloned();
        let mut index = file.index_in_parent(id)?;
        let rest = rest.to_string();
        draft.set_text(id, format!("{head}{first}"));
        let mut caret = None;
        for (k, line) in more.iter().enumerate() {
            let last = k + 1 == more.len();
            let text = if last {
                format!("{line}{rest}")
            } else {
                line.to_string()
            };
            let block = draft.new_block(text, marker);
            let new_id = block.id.clone();
            index += 1;
            draft.file.insert_block(block, parent.as_ref(), index);
            if last {
                caret = Some(Selection::caret(&new_id, char_count(line)));
            }
        }
        draft.done(caret)
    }

    pub fn toggle_task_marker(
        file: &OutlinerFile,
        id: &BlockId,
        ctx: EditContext<'_>,
    ) -> Option<EditOutcome> {
        if !editable(file, id, ctx.scope) {
            return None;
        }
        let text = &file.block(id)?.text;
        let next = match TaskState::of(text) {
            TaskState::None => format!("{TODO_PREFIX}{text}"),
            TaskState::Todo | TaskState::Done => text[TODO_PREFIX.len()..].to_string(),
        };
        let mut draft = Draft::new(file, ctx);
        draft.set_text(id, next);
        draft.done(None)
    }

    pub fn toggle_task_status(
        file: &OutlinerFile,
        id: &BlockId,
        ctx: EditContext<'_>,
    ) -> Option<EditOutcome> {
        if !editable(file, id, ctx.scope) {
            return None;
        }
        let text = &file.block(id)?.text;
        let next = match TaskState::of(text) {
            TaskState::None => return None,
            TaskState::Todo => format!("{DONE_PREFIX}{}", text.strip_prefix(TODO_PREFIX)?),
            TaskState::Done => format!("{TODO_PREFIX}{}", text.get(DONE_PREFIX.len()..)?),
        };
        let mut draft = Draft::new(file, ctx);
        draft.set_text(id, next);
        draft.done(None)
    }

    /// Move a subtree under `parent` (the roots when `None`). `index` counts siblings
    /// after the moved block has been taken out, and is clamped.
    pub fn reparent_move(
        file: &OutlinerFile,
        id: &BlockId,
        parent: Option<&BlockId>,
        index: usize,
        ctx: EditContext<'_>,
    ) -> Option<EditOutcome> {
        if !editable(file, id, ctx.scope) {
            return None;
        }
        match (parent, ctx.scope) {
            (Some(p), scope) if !file.in_scope(p, scope) => return None,
            (None, Some(_)) => return None,
            _ => {}
        }
        if let Err(err) = file.check_move(id, parent) {
            tracing::debug!(%err, "rejecting move");
            return None;
        }
        let mut draft = Draft::new(file, ctx);
        let (old_parent, old_index) = draft.file.detach(id)?;
        let target_len = draft.file.siblings(parent).len();
        let index = index.min(target_len);
        if old_parent.as_ref() == parent && old_index == index {
            return None;
        }
        draft.file.attach(id, parent, index);
        draft.touch(id);
        draft.done(None)
    }

    pub fn move_up(file: &OutlinerFile, id: &BlockId, ctx: EditContext<'_>) -> Option<EditOutcome> {
        let index = file.index_in_parent(id)?.checked_sub(1)?;
        let parent = file.parent_of(id).cloned();
        reparent_move(file, id, parent.as_ref(), index, ctx)
    }

    pub fn move_down(
        file: &OutlinerFile,
        id: &BlockId,
        ctx: EditContext<'_>,
    ) -> Option<EditOutcome> {
        file.next_sibling(id)?;
        let index = file.index_in_parent(id)? + 1;
        let parent = file.parent_of(id).cloned();
        reparent_move(file, id, parent.as_ref(), index, ctx)
    }

}

pub mod storage {
    use super::core::OutlinerFile;
    use anyhow::{Context, Result};
    use std::{
        cell::RefCell,
        fs,
        path::{Path, PathBuf},
        time::SystemTime,
    };

    /// Where a document's bytes live. The scheduler only ever talks to this trait.
    pub trait DocumentStore {
        fn read(&self) -> Result<String>;
        fn write(&self, contents: &str) -> Result<()>;
        /// Opaque modification signal; changes whenever someone else writes.
        fn modified(&self) -> Result<Option<SystemTime>>;
        fn name(&self) -> String;
    }

    /// Parsing is independent of where the text came from.
    pub trait OutlineParser {
        fn parse_file(&self, abs_path: &Path) -> Result<OutlinerFile>;
    }

    /// A single file on disk.
    #[derive(Debug, Clone)]
    pub struct FsStore {
        path: PathBuf,
    }

    impl FsStore {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl DocumentStore for FsStore {
        fn read(&self) -> Result<String> {
            fs::read_to_string(&self.path).with_context(|| format!("reading {:?}", self.path))
        }

        fn write(&self, contents: &str) -> Result<()> {
            fs::write(&self.path, contents).with_context(|| format!("writing {:?}", self.path))
        }

        fn modified(&self) -> Result<Option<SystemTime>> {
            match fs::metadata(&self.path) {
                Ok(meta) => Ok(meta.modified().ok()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(err) => Err(err).with_context(|| format!("stat {:?}", self.path)),
            }
        }

        fn name(&self) -> String {
            self.path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.path.display().to_string())
        }
    }

    /// In-memory store for hosts without a filesystem and for tests. The modification
    /// signal is a counter bumped on every write.
    #[derive(Debug, Default)]
    pub struct MemoryStore {
        name: String,
        inner: RefCell<MemoryInner>,
    }

    #[derive(Debug, Default)]
    struct MemoryInner {
        contents: String,
        revision: u64,
        writes: usize,
        fail_writes: bool,
    }

    impl MemoryStore {
        pub fn new(name: &str, contents: &str) -> Self {
            Self {
                name: name.to_string(),
                inner: RefCell::new(MemoryInner {
                    contents: contents.to_string(),
                    revision: 1,
                    ..MemoryInner::default()
                }),
            }
        }

        pub fn contents(&self) -> String {
            self.inner.borrow().contents.clone()
        }

        /// Number of successful writes through the trait.
        pub fn writes(&self) -> usize {
            self.inner.borrow().writes
        }

        /// Simulate another program replacing the file.
        pub fn replace_externally(&self, contents: &str) {
            let mut inner = self.inner.borrow_mut();
            inner.contents = contents.to_string();
            inner.revision += 1;
        }

        pub fn set_failing(&self, failing: bool) {
            self.inner.borrow_mut().fail_writes = failing;
        }
    }

    impl DocumentStore for MemoryStore {
        fn read(&self) -> Result<String> {
            Ok(self.contents())
        }

        fn write(&self, contents: &str) -> Result<()> {
            let mut inner = self.inner.borrow_mut();
            if inner.fail_writes {
                anyhow::bail!("write to {} rejected", self.name);
            }
            inner.contents = contents.to_string();
            inner.revision += 1;
            inner.writes += 1;
            Ok(())
        }

        fn modified(&self) -> Result<Option<SystemTime>> {
            let revision = self.inner.borrow().revision;
            Ok(Some(
                SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(revision),
            ))
        }

        fn name(&self) -> String {
            self.name.clone()
        }
    }

}

pub mod persist {
    //! Debounced write-back of an outline to its store.
    //!
    //! The scheduler is driven from outside: callers pass the current `Instant` and poll.
    //! A write can also be split into `begin_flush`/`finish_flush` so the host performs
    //! the I/O asynchronously; the in-flight guard keeps a second flush from starting.

    use super::config::Settings;
    use super::core::{BlockId, OutlinerFile};
    use super::format::{FormatOptions, format_outline_with};
    use super::parser::parse_outline;
    use super::storage::DocumentStore;
    use anyhow::Result;
    use std::collections::BTreeSet;
    use std::time::{Duration, Instant, SystemTime};

    /// One cancellable deadline.
    #[derive(Debug, Clone, Default)]
    pub struct DebounceTimer {
        delay: Duration,
        deadline: Option<Instant>,
    }

    impl DebounceTimer {
        pub fn new(delay: Duration) -> Self {
            Self {
                delay,
                deadline: None,
            }
        }

        /// (Re)start the quiet period from `now`.
        pub fn arm(&mut self, now: Instant) {
            self.arm_after(now, self.delay);
        }

        pub fn arm_after(&mut self, now: Instant, delay: Duration) {
            self.deadline = Some(now + delay);
        }

        pub fn cancel(&mut self) {
            self.deadline = None;
        }

        pub fn is_armed(&self) -> bool {
            self.deadline.is_some()
        }

        pub fn deadline(&self) -> Option<Instant> {
            self.deadline
        }

        pub fn expired(&self, now: Instant) -> bool {
            self.deadline.is_some_and(|d| now >= d)
        }
    }

    /// A write handed to the host: the text to store and the ids it covers.
    #[derive(Debug, Clone)]
    pub struct FlushJob {
        pub text: String,
        pub ids: BTreeSet<BlockId>,
    }

    #[derive(Debug)]
    pub enum FlushOutcome {
        Idle,
        Written,
        /// The store changed underneath a clean document; this is the re-parsed file.
        Reloaded(OutlinerFile),
        Failed(String),
    }

    #[derive(Debug)]
    pub struct PersistenceScheduler {
        dirty: BTreeSet<BlockId>,
        /// Ids edited while a write was in flight; they stay dirty after it lands.
        late: BTreeSet<BlockId>,
        pending: bool,
        timer: DebounceTimer,
        retry_backoff: Duration,
        in_flight: bool,
        last_signal: Option<SystemTime>,
        last_saved: Option<Instant>,
        format: FormatOptions,
    }

    impl PersistenceScheduler {
        pub fn new(settings: &Settings) -> Self {
            Self {
                dirty: BTreeSet::new(),
                late: BTreeSet::new(),
                pending: false,
                timer: DebounceTimer::new(settings.debounce),
                retry_backoff: settings.retry_backoff,
                in_flight: false,
                last_signal: None,
                last_saved: None,
                format: settings.format_options(),
            }
        }

        /// Remember the store's current modification signal as our own.
        pub fn attach(&mut self, store: &dyn DocumentStore) -> Result<()> {
            self.last_signal = store.modified()?;
            Ok(())
        }

        pub fn is_dirty(&self) -> bool {
            !self.dirty.is_empty()
        }

        pub fn dirty(&self) -> &BTreeSet<BlockId> {
            &self.dirty
        }

        pub fn is_pending(&self) -> bool {
            self.pending
        }

        pub fn in_flight(&self) -> bool {
            self.in_flight
        }

        pub fn deadline(&self) -> Option<Instant> {
            self.timer.deadline()
        }

        pub fn last_saved(&self) -> Option<Instant> {
            self.last_saved
        }

        pub fn mark_dirty<I>(&mut self, ids: I, now: Instant)
        where
            I: IntoIterator<Item = BlockId>,
        {
            let before = self.dirty.len();
            for id in ids {
                if self.in_flight {
                    self.late.insert(id.clone());
                }
                self.dirty.insert(id);
            }
            if self.dirty.len() == before && !self.pending {
                return;
            }
            self.pending = true;
            self.timer.arm(now);
        }

        /// Start a write if the quiet period is over and none is running.
        pub fn begin_flush(&mut self, now: Instant, file: &OutlinerFile) -> Option<FlushJob> {
            if !self.timer.expired(now) {
                return None;
            }
            self.start(file)
        }

        fn start(&mut self, file: &OutlinerFile) -> Option<FlushJob> {
            if self.in_flight || !self.pending {
                return None;
            }
            self.in_flight = true;
            self.timer.cancel();
            Some(FlushJob {
                text: format_outline_with(file, &self.format),
                ids: self.dirty.clone(),
            })
        }

        /// Record the result of a write. `result` carries the store's new modification
        /// signal on success.
        pub fn finish_flush(
            &mut self,
            job: FlushJob,
            result: Result<Option<SystemTime>>,
            now: Instant,
        ) -> FlushOutcome {
            self.in_flight = false;
            let late = std::mem::take(&mut self.late);
            match result {
                Ok(signal) => {
                    self.dirty
                        .retain(|id| !job.ids.contains(id) || late.contains(id));
                    self.last_signal = signal;
                    self.last_saved = Some(now);
                    self.pending = !self.dirty.is_empty();
                    if self.pending {
                        self.timer.arm(now);
                    }
                    tracing::debug!(blocks = job.ids.len(), "outline written");
                    FlushOutcome::Written
                }
                Err(err) => {
                    tracing::warn!(error = %format!("{err:#}"), "write failed; retrying");
                    self.pending = true;
                    self.timer.arm_after(now, self.retry_backoff);
                    FlushOutcome::Failed(format!("{err:#}"))
                }
            }
        }

        /// Run one scheduling step: write when due, otherwise look for external edits.
        pub fn poll(
            &mut self,
            now: Instant,
            file: &OutlinerFile,
            store: &dyn DocumentStore,
        ) -> FlushOutcome {
            if self.in_flight {
                return FlushOutcome::Idle;
            }
            if !self.pending {
                return self.on_external_change(store);
            }
            if !self.timer.expired(now) {
                return FlushOutcome::Idle;
            }
            if self.changed_externally(store) {
                tracing::info!("store changed externally; local edits win");
            }
            match self.begin_flush(now, file) {
                Some(job) => self.write(job, store, now),
                None => FlushOutcome::Idle,
            }
        }

        /// Write immediately regardless of the debounce (document close, explicit save).
        pub fn flush_now(
            &mut self,
            now: Instant,
            file: &OutlinerFile,
            store: &dyn DocumentStore,
        ) -> FlushOutcome {
            match self.start(file) {
                Some(job) => self.write(job, store, now),
                None => FlushOutcome::Idle,
            }
        }

        fn write(&mut self, job: FlushJob, store: &dyn DocumentStore, now: Instant) -> FlushOutcome {
            let result = store.write(&job.text).and_then(|_| store.modified());
            self.finish_flush(job, result, now)
        }

        fn changed_externally(&self, store: &dyn DocumentStore) -> bool {
            match store.modified() {
                Ok(signal) => signal != self.last_signal,
                Err(err) => {
                    tracing::debug!(error = %err, "cannot read modification signal");
                    false
                }
            }
        }

        /// React to a change notification from the host. Echoes of our own writes are
        /// ignored; a clean document is re-parsed; local edits win otherwise.
        pub fn on_external_change(&mut self, store: &dyn DocumentStore) -> FlushOutcome {
            if self.in_flight || !self.changed_externally(store) {
                return FlushOutcome::Idle;
            }
            if self.is_dirty() {
                tracing::info!(
                    dirty = self.dirty.len(),
                    "ignoring external change; pending local edits will overwrite it"
                );
                return FlushOutcome::Idle;
            }
            let reloaded = store.read().and_then(|text| Ok((text, store.modified()?)));
            match reloaded {
                Ok((text, signal)) => {
                    self.last_signal = signal;
                    tracing::debug!(store = %store.name(), "reloading after external change");
                    FlushOutcome::Reloaded(parse_outline(&text))
                }
                Err(err) => {
                    tracing::warn!(error = %format!("{err:#}"), "reload failed");
                    FlushOutcome::Failed(format!("{err:#}"))
                }
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::storage::MemoryStore;

        fn settings() -> Settings {
            Settings {
                debounce: Duration::from_millis(500),
                retry_backoff: Duration::from_millis(2000),
                ..Settings::default()
            }
        }

        fn ms(n: u64) -> Duration {
            Duration::from_millis(n)
        }

        fn setup(text: &str) -> (PersistenceScheduler, MemoryStore, OutlinerFile) {
            let store = MemoryStore::new("notes", text);
            let file = parse_outline(text);
            let mut scheduler = PersistenceScheduler::new(&settings());
            scheduler.attach(&store).expect("signal");
            (scheduler, store, file)
        }

        #[test]
        fn rapid_edits_produce_one_write() {
            let (mut scheduler, store, file) = setup("- a ^a\n");
            let t0 = Instant::now();
            for step in 0..5 {
                scheduler.mark_dirty([BlockId::from("a")], t0 + ms(step * 100));
                assert!(matches!(
                    scheduler.poll(t0 + ms(step * 100 + 50), &file, &store),
                    FlushOutcome::Idle
                ));
            }
            assert!(matches!(scheduler.poll(t0 + ms(899), &file, &store), FlushOutcome::Idle));
            assert!(matches!(
                scheduler.poll(t0 + ms(900), &file, &store),
                FlushOutcome::Written
            ));
            assert_eq!(store.writes(), 1);
            assert!(!scheduler.is_dirty());
            assert!(matches!(scheduler.poll(t0 + ms(5000), &file, &store), FlushOutcome::Idle));
            assert_eq!(store.writes(), 1);
            assert!(store.contents().contains("^a\n"));
        }

        #[test]
        fn failed_write_keeps_dirty_and_backs_off() {
            let (mut scheduler, store, file) = setup("- a ^a\n");
            let t0 = Instant::now();
            store.set_failing(true);
            scheduler.mark_dirty([BlockId::from("a")], t0);
            assert!(matches!(
                scheduler.poll(t0 + ms(500), &file, &store),
                FlushOutcome::Failed(_)
            ));
            assert!(scheduler.is_dirty());
            store.set_failing(false);
            assert!(matches!(scheduler.poll(t0 + ms(1000), &file, &store), FlushOutcome::Idle));
            assert!(matches!(
                scheduler.poll(t0 + ms(2500), &file, &store),
                FlushOutcome::Written
            ));
            assert!(!scheduler.is_dirty());
        }

        #[test]
        fn in_flight_guard_and_late_edits() {
            let (mut scheduler, _store, file) = setup("- a ^a\n- b ^b\n");
            let t0 = Instant::now();
            scheduler.mark_dirty([BlockId::from("a")], t0);
            let job = scheduler.begin_flush(t0 + ms(500), &file).expect("due");
            assert!(scheduler.in_flight());
            assert!(scheduler.begin_flush(t0 + ms(600), &file).is_none());

            scheduler.mark_dirty([BlockId::from("a"), BlockId::from("b")], t0 + ms(600));
            let outcome = scheduler.finish_flush(job, Ok(None), t0 + ms(700));
            assert!(matches!(outcome, FlushOutcome::Written));
            let expected: BTreeSet<BlockId> = ["a", "b"].into_iter().map(BlockId::from).collect();
            assert_eq!(scheduler.dirty(), &expected);
            assert!(scheduler.is_pending());
        }

        #[test]
        fn clean_document_reloads_external_change() {
            let (mut scheduler, store, _file) = setup("- a ^a\n");
            store.replace_externally("- changed ^a\n");
            let FlushOutcome::Reloaded(file) = scheduler.on_external_change(&store) else {
                panic!("expected reload");
            };
            assert_eq!(file.block(&"a".into()).unwrap().text, "changed");
            assert!(matches!(scheduler.on_external_change(&store), FlushOutcome::Idle));
        }

        #[test]
        fn own_writes_are_not_external_changes() {
            let (mut scheduler, store, file) = setup("- a ^a\n");
            let t0 = Instant::now();
            scheduler.mark_dirty([BlockId::from("a")], t0);
            assert!(matches!(scheduler.flush_now(t0, &file, &store), FlushOutcome::Written));
            assert!(matches!(scheduler.on_external_change(&store), FlushOutcome::Idle));
        }

        #[test]
        fn local_edits_win_over_external_change() {
            let (mut scheduler, store, file) = setup("- a ^a\n");
            let t0 = Instant::now();
            scheduler.mark_dirty([BlockId::from("a")], t0);
            store.replace_externally("- someone else ^a\n");
            assert!(matches!(scheduler.on_external_change(&store), FlushOutcome::Idle));
            assert!(matches!(
                scheduler.poll(t0 + ms(500), &file, &store),
                FlushOutcome::Written
            ));
            assert!(!store.contents().contains("someone else"));
        }

        #[test]
        fn timer_rearms() {
            let mut timer = DebounceTimer::new(ms(100));
            let t0 = Instant::now();
            assert!(!timer.expired(t0));
            timer.arm(t0);
            timer.arm(t0 + ms(50));
            assert!(!timer.expired(t0 + ms(100)));
            assert!(timer.expired(t0 + ms(150)));
            timer.cancel();
            assert!(!timer.is_armed());
        }
    }
}

pub mod view {
    //! Headless interactive state for one open document.
    //!
    //! The host feeds pointer, keyboard and scroll events plus the current `Instant`;
    //! the controller owns the tree, decides what is visible, which block is being
    //! edited and where a dragged block would land. Rendering stays with the host:
    //! it asks for [`ViewController::render_window`] and draws the rows it gets.

    use super::bridges::{self, CommandGate, EditorAdapter, SuggestionContext};
    use super::config::Settings;
    use super::core::*;
    use super::edit::{self, EditCommand, EditContext, PasteMode};
    use super::format::format_blocks;
    use super::parser::parse_outline;
    use super::persist::{FlushOutcome, PersistenceScheduler};
    use super::storage::DocumentStore;
    use anyhow::{Context, Result};
    use chrono::Utc;
    use std::collections::HashMap;
    use std::time::Instant;

    /* ------------------------------ Geometry ------------------------------ */

    /// Content coordinates: `y` grows downward from the top of the first row.
    #[derive(Debug, Clone, Copy, PartialEq, Default)]
    pub struct Point {
        pub x: f32,
        pub y: f32,
    }

    impl Point {
        pub fn new(x: f32, y: f32) -> Self {
            Self { x, y }
        }

        fn distance(self, other: Point) -> f32 {
            ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
        }
    }

    /// Text metrics of the mounted editor, used to place popups at a caret.
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct EditorGeometry {
        pub origin: Point,
        pub char_width: f32,
        pub line_height: f32,
    }

    impl Default for EditorGeometry {
        fn default() -> Self {
            Self {
                origin: Point::default(),
                char_width: 8.0,
                line_height: 20.0,
            }
        }
    }

    impl EditorGeometry {
        pub fn point_at(&self, text: &str, offset: usize) -> Point {
            let mut line = 0usize;
            let mut column = 0usize;
            for c in text.chars().take(offset) {
                if c == '\n' {
                    line += 1;
                    column = 0;
                } else {
                    column += 1;
                }
            }
            Point {
                x: self.origin.x + column as f32 * self.char_width,
                y: self.origin.y + line as f32 * self.line_height,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Default)]
    pub struct Viewport {
        pub scroll_top: f32,
        pub height: f32,
    }

    /* -------------------------------- Rows -------------------------------- */

    #[derive(Debug, Clone, PartialEq)]
    pub struct Row {
        pub id: BlockId,
        pub depth: usize,
        pub top: f32,
        pub height: f32,
        pub has_children: bool,
        pub collapsed: bool,
        pub task: TaskState,
        /// Parse warnings exist; `display` is sanitized.
        pub warning: bool,
        pub display: String,
        pub editing: bool,
        pub selected: bool,
    }

    /// Rows to materialize plus the space taken by the rows that are not.
    #[derive(Debug, Clone, PartialEq, Default)]
    pub struct RenderWindow {
        pub rows: Vec<Row>,
        pub top_spacer: f32,
        pub bottom_spacer: f32,
        pub total_height: f32,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Crumb {
        pub level: usize,
        pub id: Option<BlockId>,
        pub label: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Banner {
        pub block: BlockId,
        pub message: String,
    }

    #[derive(Debug, Default)]
    struct Layout {
        rows: Vec<(BlockId, usize)>,
        /// `rows.len() + 1` entries; the last one is the content height.
        origins: Vec<f32>,
        index: HashMap<BlockId, usize>,
    }

    /* ---------------------------- Active editor ---------------------------- */

    /// The one mounted text editor. Offsets are characters.
    #[derive(Debug, Clone)]
    pub struct ActiveEditor {
        block: BlockId,
        value: String,
        cursor: usize,
        selection: Option<(usize, usize)>,
        geometry: EditorGeometry,
    }

    impl ActiveEditor {
        fn new(block: BlockId, value: String, cursor: usize, geometry: EditorGeometry) -> Self {
            let cursor = cursor.min(value.chars().count());
            Self {
                block,
                value,
                cursor,
                selection: None,
                geometry,
            }
        }

        pub fn block(&self) -> &BlockId {
            &self.block
        }

        pub fn text(&self) -> &str {
            &self.value
        }

        pub fn caret(&self) -> usize {
            self.cursor
        }

        fn len(&self) -> usize {
            self.value.chars().count()
        }

        /// Adopt text changed by an edit; the caret keeps its distance from the end.
        fn sync(&mut self, text: &str) {
            if self.value == text {
                return;
            }
            let old = self.len() as isize;
            self.value = text.to_string();
            let new = self.len() as isize;
            self.cursor = (self.cursor as isize + new - old).clamp(0, new) as usize;
            self.selection = None;
        }
    }

    impl EditorAdapter for ActiveEditor {
        fn value(&self) -> String {
            self.value.clone()
        }

        fn set_value(&mut self, value: &str) {
            self.value = value.to_string();
            self.cursor = self.cursor.min(self.len());
            self.selection = None;
        }

        fn cursor(&self) -> usize {
            self.cursor
        }

        fn set_cursor(&mut self, offset: usize) {
            self.cursor = offset.min(self.len());
            self.selection = None;
        }

        fn selection(&self) -> Option<(usize, usize)> {
            self.selection
        }

        fn set_selection(&mut self, selection: Option<(usize, usize)>) {
            let len = self.len();
            self.selection = selection.map(|(a, h)| (a.min(len), h.min(len)));
            if let Some((_, head)) = self.selection {
                self.cursor = head;
            }
        }

        fn coords_at(&self, offset: usize) -> Point {
            self.geometry.point_at(&self.value, offset)
        }
    }

    /* ------------------------------ Gestures ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DropPosition {
        Before,
        After,
        Inside,
    }

    /// Where a drop would land, already resolved to a move.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct DropPreview {
        pub target: BlockId,
        pub position: DropPosition,
        pub parent: Option<BlockId>,
        /// Index among `parent`'s children once the dragged block is taken out.
        pub index: usize,
    }

    #[derive(Debug, Clone)]
    enum Gesture {
        Idle,
        /// Handle pressed, not yet moved far enough to count as a drag.
        Pending { block: BlockId, origin: Point },
        Dragging { block: BlockId },
        /// Pointer pressed inside the editor text.
        Editing { block: BlockId },
        Selecting { anchor: BlockId, head: BlockId },
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Key {
        Enter,
        Backspace,
        Delete,
        Tab,
        ShiftTab,
        ArrowUp,
        ArrowDown,
        MoveUp,
        MoveDown,
        ToggleTask,
        ToggleTaskStatus,
        Escape,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DeleteRequest {
        Nothing,
        Deleted,
        NeedsConfirmation,
    }

    /* ---------------------------- Controller ---------------------------- */

    pub struct ViewController {
        file: OutlinerFile,
        name: String,
        settings: Settings,
        scheduler: PersistenceScheduler,
        zoom: Vec<BlockId>,
        editor: Option<ActiveEditor>,
        geometry: EditorGeometry,
        gesture: Gesture,
        drop_preview: Option<DropPreview>,
        range: Option<(BlockId, BlockId)>,
        heights: HashMap<BlockId, f32>,
        layout: Layout,
        viewport: Viewport,
        pending_delete: Option<Vec<BlockId>>,
        cooldown_until: Option<Instant>,
    }

    impl ViewController {
        pub fn new(file: OutlinerFile, name: impl Into<String>, settings: Settings) -> Self {
            let scheduler = PersistenceScheduler::new(&settings);
            let geometry = EditorGeometry {
                line_height: settings.row_height,
                ..EditorGeometry::default()
            };
            let mut view = Self {
                file,
                name: name.into(),
                settings,
                scheduler,
                zoom: Vec::new(),
                editor: None,
                geometry,
                gesture: Gesture::Idle,
                drop_preview: None,
                range: None,
                heights: HashMap::new(),
                layout: Layout::default(),
                viewport: Viewport::default(),
                pending_delete: None,
                cooldown_until: None,
            };
            view.relayout();
            view
        }

        pub fn open(store: &dyn DocumentStore, settings: Settings) -> Result<Self> {
            let text = store
                .read()
                .with_context(|| format!("opening {}", store.name()))?;
            let mut view = Self::new(parse_outline(&text), store.name(), settings);
            view.scheduler.attach(store)?;
            Ok(view)
        }

        pub fn file(&self) -> &OutlinerFile {
            &self.file
        }

        pub fn settings(&self) -> &Settings {
            &self.settings
        }

        pub fn scheduler(&self) -> &PersistenceScheduler {
            &self.scheduler
        }

        /// Current zoom root; `None` shows the whole file.
        pub fn scope(&self) -> Option<&BlockId> {
            self.zoom.last()
        }

        pub fn zoom_stack(&self) -> &[BlockId] {
            &self.zoom
        }

        pub fn editor(&self) -> Option<&ActiveEditor> {
            self.editor.as_ref()
        }

        pub fn editor_mut(&mut self) -> Option<&mut ActiveEditor> {
            self.editor.as_mut()
        }

        pub fn drop_preview(&self) -> Option<&DropPreview> {
            self.drop_preview.as_ref()
        }

        pub fn pending_delete(&self) -> Option<&[BlockId]> {
            self.pending_delete.as_deref()
        }

        /* ------------------------------ Layout ------------------------------ */

        fn relayout(&mut self) {
            let rows = self.file.visible_rows(self.zoom.last());
            let mut origins = Vec::with_capacity(rows.len() + 1);
            let mut index = HashMap::with_capacity(rows.len());
            let mut y = 0.0;
            for (ix, (id, _)) in rows.iter().enumerate() {
                origins.push(y);
                y += self.row_height(id);
                index.insert(id.clone(), ix);
            }
            origins.push(y);
            self.layout = Layout {
                rows,
                origins,
                index,
            };
        }

        fn row_height(&self, id: &BlockId) -> f32 {
            self.heights
                .get(id)
                .copied()
                .unwrap_or(self.settings.row_height)
                .max(1.0)
        }

        /// Measured height of a row, reported by the host after rendering it.
        pub fn set_row_height(&mut self, id: &BlockId, height: f32) {
            if height.is_finite() {
                self.heights.insert(id.clone(), height.max(1.0));
                self.relayout();
            }
        }

        pub fn set_viewport(&mut self, scroll_top: f32, height: f32) {
            self.viewport = Viewport { scroll_top, height };
        }

        pub fn set_editor_metrics(&mut self, char_width: f32, line_height: f32) {
            self.geometry.char_width = char_width;
            self.geometry.line_height = line_height;
        }

        /// Index of the row covering `y`; the row count when `y` is past the end.
        fn index_for_y(&self, y: f32) -> usize {
            let count = self.layout.rows.len();
            if count == 0 || !y.is_finite() {
                return 0;
            }
            let y = y.max(0.0);
            let end = self.layout.origins[count];
            if y >= end {
                return count;
            }
            let (mut lo, mut hi) = (0usize, count);
            while lo < hi {
                let mid = (lo + hi) / 2;
                if self.layout.origins[mid + 1] <= y {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            lo
        }

        fn row_id_at(&self, y: f32) -> Option<BlockId> {
            let ix = self.index_for_y(y);
            self.layout.rows.get(ix).map(|(id, _)| id.clone())
        }

        fn range_indices(&self) -> Option<(usize, usize)> {
            let (anchor, head) = self.range.as_ref()?;
            let a = *self.layout.index.get(anchor)?;
            let h = *self.layout.index.get(head)?;
            Some((a.min(h), a.max(h)))
        }

        fn row_at(&self, ix: usize, range: Option<(usize, usize)>) -> Option<Row> {
            let (id, depth) = self.layout.rows.get(ix)?;
            let block = self.file.block(id)?;
            let top = self.layout.origins[ix];
            Some(Row {
                id: id.clone(),
                depth: *depth,
                top,
                height: self.layout.origins[ix + 1] - top,
                has_children: !block.children.is_empty(),
                collapsed: block.collapsed,
                task: block.task_state(),
                warning: !block.warnings.is_empty(),
                display: display_text(block),
                editing: self.editor.as_ref().is_some_and(|e| e.block == *id),
                selected: range.is_some_and(|(lo, hi)| (lo..=hi).contains(&ix)),
            })
        }

        /// Every visible row of the current scope.
        pub fn rows(&self) -> Vec<Row> {
            let range = self.range_indices();
            (0..self.layout.rows.len())
                .filter_map(|ix| self.row_at(ix, range))
                .collect()
        }

        /// Rows intersecting the viewport plus `buffer_rows` on either side.
        pub fn render_window(&self) -> RenderWindow {
            let count = self.layout.rows.len();
            let total_height = self.layout.origins.last().copied().unwrap_or(0.0);
            if count == 0 {
                return RenderWindow::default();
            }
            let top = self.viewport.scroll_top.max(0.0);
            let bottom = top + self.viewport.height.max(0.0);
            let first_visible = self.index_for_y(top).min(count - 1);
            let last_visible = self.index_for_y(bottom).min(count - 1);
            let start = first_visible.saturating_sub(self.settings.buffer_rows);
            let end = (last_visible + self.settings.buffer_rows + 1).min(count);
            let range = self.range_indices();
            RenderWindow {
                rows: (start..end)
                    .filter_map(|ix| self.row_at(ix, range))
                    .collect(),
                top_spacer: self.layout.origins[start],
                bottom_spacer: total_height - self.layout.origins[end],
                total_height,
            }
        }

        /* ------------------------------ Editing ------------------------------ */

        fn editable(&self, id: &BlockId) -> bool {
            self.file.in_scope(id, self.scope()) && self.scope() != Some(id)
        }

        /// Mount the editor on `id`, committing and unmounting any previous one.
        pub fn enter_edit(&mut self, id: &BlockId, offset: usize, now: Instant) -> bool {
            if !self.editable(id) {
                return false;
            }
            self.commit(now);
            self.range = None;
            self.mount(id, offset);
            true
        }

        pub fn exit_edit(&mut self, now: Instant) {
            self.commit(now);
            self.editor = None;
        }

        /// Write the editor's text back into the tree.
        pub fn commit(&mut self, now: Instant) -> bool {
            let Some(editor) = &self.editor else {
                return false;
            };
            let command = EditCommand::SetText {
                block: editor.block.clone(),
                text: editor.value.clone(),
            };
            self.run(command, now).is_some()
        }

        /// Text typed into the editor.
        pub fn input(&mut self, value: &str, cursor: usize, now: Instant) -> bool {
            let Some(editor) = self.editor.as_mut() else {
                return false;
            };
            editor.set_value(value);
            editor.set_cursor(cursor);
            self.commit(now)
        }

        fn mount(&mut self, id: &BlockId, offset: usize) {
            self.reveal(id);
            let Some(block) = self.file.block(id) else {
                return;
            };
            let text = block.text.clone();
            let geometry = self.geometry_for(id);
            self.editor = Some(ActiveEditor::new(id.clone(), text, offset, geometry));
        }

        fn geometry_for(&self, id: &BlockId) -> EditorGeometry {
            let Some(ix) = self.layout.index.get(id).copied() else {
                return self.geometry;
            };
            let depth = self.layout.rows[ix].1;
            EditorGeometry {
                origin: Point {
                    x: (depth + 1) as f32 * self.settings.indent_width,
                    y: self.layout.origins[ix] - self.viewport.scroll_top,
                },
                ..self.geometry
            }
        }

        /// Expand collapsed ancestors so `id` has a row.
        fn reveal(&mut self, id: &BlockId) {
            let mut ancestors = Vec::new();
            let mut cur = self.file.parent_of(id).cloned();
            while let Some(parent) = cur {
                cur = self.file.parent_of(&parent).cloned();
                ancestors.push(parent);
            }
            let mut changed = false;
            for ancestor in ancestors {
                if let Some(block) = self.file.block_mut(&ancestor) {
                    changed |= std::mem::replace(&mut block.collapsed, false);
                }
            }
            if changed {
                self.relayout();
            }
        }

        /// Apply an edit, install the result and hand dirty ids to the scheduler.
        fn run(&mut self, command: EditCommand, now: Instant) -> Option<Option<Selection>> {
            let outcome = {
                let ctx = EditContext::new(self.zoom.last(), Utc::now());
                edit::apply(&self.file, &command, ctx)?
            };
            self.scheduler.mark_dirty(outcome.dirty, now);
            self.file = outcome.file;
            self.after_change();
            Some(outcome.selection)
        }

        /// Commit the editor, then run `command` and follow its selection.
        pub fn execute(&mut self, command: EditCommand, now: Instant) -> bool {
            self.commit(now);
            match self.run(command, now) {
                Some(selection) => {
                    self.apply_selection(selection);
                    true
                }
                None => false,
            }
        }

        fn apply_selection(&mut self, selection: Option<Selection>) {
            match selection {
                Some(Selection::Caret { block, offset }) => self.mount(&block, offset),
                Some(Selection::Text {
                    block,
                    anchor,
                    head,
                }) => {
                    self.mount(&block, head);
                    if let Some(editor) = self.editor.as_mut() {
                        editor.set_selection(Some((anchor, head)));
                    }
                }
                Some(Selection::Blocks { anchor, head }) => {
                    self.editor = None;
                    self.range = Some((anchor, head));
                }
                None => {}
            }
        }

        /// Drop state that points at blocks which no longer exist, then relayout.
        fn after_change(&mut self) {
            if let Some(pos) = self.zoom.iter().position(|z| !self.file.contains(z)) {
                self.zoom.truncate(pos);
            }
            let editor_gone = match self.editor.as_mut() {
                Some(editor) => match self.file.block(&editor.block) {
                    Some(block) => {
                        editor.sync(&block.text);
                        false
                    }
                    None => true,
                },
                None => false,
            };
            if editor_gone {
                self.editor = None;
            }
            if self
                .range
                .as_ref()
                .is_some_and(|(a, h)| !self.file.contains(a) || !self.file.contains(h))
            {
                self.range = None;
            }
            self.heights.retain(|id, _| self.file.contains(id));
            self.relayout();
        }

        /* ------------------------------ Keyboard ------------------------------ */

        pub fn handle_key(&mut self, key: Key, now: Instant) -> bool {
            let Some(editor) = &self.editor else {
                return false;
            };
            let block = editor.block.clone();
            let cursor = editor.cursor;
            let len = editor.len();
            let has_selection = editor.selection.is_some_and(|(a, h)| a != h);
            let on_first_line = !editor.value.chars().take(cursor).any(|c| c == '\n');
            let on_last_line = !editor.value.chars().skip(cursor).any(|c| c == '\n');

            match key {
                Key::Enter => self.execute(
                    EditCommand::Split {
                        block,
                        offset: cursor,
                    },
                    now,
                ),
                Key::Backspace if cursor == 0 && !has_selection => {
                    self.commit(now);
                    let empty_leaf = self
                        .file
                        .block(&block)
                        .is_some_and(|b| b.text.is_empty() && b.children.is_empty());
                    if !empty_leaf {
                        return self.execute(EditCommand::MergeBackward { block }, now);
                    }
                    // The last visible row stays; there is nowhere to put the caret.
                    if self.layout.rows.len() <= 1 {
                        return false;
                    }
                    self.execute(EditCommand::Delete { block }, now)
                }
                Key::Delete if cursor == len && !has_selection => {
                    self.execute(EditCommand::MergeForward { block }, now)
                }
                Key::Tab => self.execute(EditCommand::Indent { block }, now),
                Key::ShiftTab => self.execute(EditCommand::Outdent { block }, now),
                Key::ArrowUp if on_first_line => self.step(&block, false, cursor, now),
                Key::ArrowDown if on_last_line => self.step(&block, true, cursor, now),
                Key::MoveUp => self.execute(EditCommand::MoveUp { block }, now),
                Key::MoveDown => self.execute(EditCommand::MoveDown { block }, now),
                Key::ToggleTask => self.execute(EditCommand::ToggleTaskMarker { block }, now),
                Key::ToggleTaskStatus => {
                    self.execute(EditCommand::ToggleTaskStatus { block }, now)
                }
                Key::Escape => {
                    self.exit_edit(now);
                    true
                }
                _ => false,
            }
        }

        fn step(&mut self, from: &BlockId, down: bool, column: usize, now: Instant) -> bool {
            let Some(ix) = self.layout.index.get(from).copied() else {
                return false;
            };
            let target = if down {
                ix + 1
            } else {
                match ix.checked_sub(1) {
                    Some(t) => t,
                    None => return false,
                }
            };
            let Some((id, _)) = self.layout.rows.get(target).cloned() else {
                return false;
            };
            self.enter_edit(&id, column, now)
        }

        /// Clipboard paste into the editor. The bypass modifier keeps it in one block.
        pub fn paste(&mut self, text: &str, bypass: bool, now: Instant) -> bool {
            let Some(editor) = &self.editor else {
                return false;
            };
            let mode = if bypass {
                PasteMode::Literal
            } else {
                PasteMode::Split
            };
            let command = EditCommand::Paste {
                block: editor.block.clone(),
                offset: editor.cursor,
                text: text.to_string(),
                mode,
            };
            self.execute(command, now)
        }

        /* -------------------------------- Zoom -------------------------------- */

        pub fn zoom_in(&mut self, id: &BlockId, now: Instant) -> bool {
            if !self.editable(id) {
                return false;
            }
            self.exit_edit(now);
            self.range = None;
            self.drop_preview = None;
            self.zoom.push(id.clone());
            if let Some(block) = self.file.block_mut(id) {
                block.collapsed = false;
            }
            tracing::debug!(block = %id, depth = self.zoom.len(), "zoom in");
            self.relayout();
            true
        }

        pub fn zoom_out(&mut self, now: Instant) -> bool {
            match self.zoom.len() {
                0 => false,
                n => self.pop_to(n - 1, now),
            }
        }

        /// Keep the first `level` zoom entries; level 0 is the whole file.
        pub fn pop_to(&mut self, level: usize, now: Instant) -> bool {
            if level >= self.zoom.len() {
                return false;
            }
            self.exit_edit(now);
            self.range = None;
            self.drop_preview = None;
            self.zoom.truncate(level);
            self.relayout();
            true
        }

        pub fn breadcrumbs(&self) -> Vec<Crumb> {
            let mut crumbs = vec![Crumb {
                level: 0,
                id: None,
                label: self.name.clone(),
            }];
            for (ix, id) in self.zoom.iter().enumerate() {
                let label = self
                    .file
                    .block(id)
                    .map(|b| b.first_line().trim().to_string())
                    .filter(|l| !l.is_empty())
                    .unwrap_or_else(|| "(empty)".to_string());
                crumbs.push(Crumb {
                    level: ix + 1,
                    id: Some(id.clone()),
                    label,
                });
            }
            crumbs
        }

        /* ------------------------------ Collapse ------------------------------ */

        pub fn toggle_collapse(&mut self, id: &BlockId, now: Instant) -> bool {
            let Some(block) = self.file.block(id) else {
                return false;
            };
            if block.children.is_empty() {
                return false;
            }
            let collapsing = !block.collapsed;
            if collapsing {
                let hides_editor = self
                    .editor
                    .as_ref()
                    .is_some_and(|e| e.block != *id && self.file.is_within(&e.block, id));
                if hides_editor {
                    self.exit_edit(now);
                }
            }
            if let Some(block) = self.file.block_mut(id) {
                block.collapsed = collapsing;
            }
            self.relayout();
            if self.range.is_some() && self.range_indices().is_none() {
                self.range = None;
            }
            true
        }

        /* ---------------------------- Drag and drop ---------------------------- */

        fn in_cooldown(&self, now: Instant) -> bool {
            self.cooldown_until.is_some_and(|until| now < until)
        }

        /// Pointer pressed on a row's drag handle.
        pub fn handle_pointer_down(&mut self, id: &BlockId, at: Point) -> bool {
            if !self.layout.index.contains_key(id) {
                return false;
            }
            self.gesture = Gesture::Pending {
                block: id.clone(),
                origin: at,
            };
            true
        }

        /// Pointer pressed on a row's text: mounts the editor unless a drop just happened.
        pub fn text_pointer_down(&mut self, id: &BlockId, offset: usize, now: Instant) -> bool {
            if self.in_cooldown(now) {
                tracing::debug!(block = %id, "click ignored right after a drop");
                return false;
            }
            if !self.enter_edit(id, offset, now) {
                return false;
            }
            self.gesture = Gesture::Editing { block: id.clone() };
            true
        }

        pub fn pointer_move(&mut self, at: Point, now: Instant) {
            match std::mem::replace(&mut self.gesture, Gesture::Idle) {
                Gesture::Idle => {}
                Gesture::Pending { block, origin } => {
                    if origin.distance(at) > self.settings.drag_start_distance {
                        self.exit_edit(now);
                        self.range = None;
                        tracing::debug!(%block, "drag started");
                        self.drop_preview = self.compute_drop(&block, at);
                        self.gesture = Gesture::Dragging { block };
                    } else {
                        self.gesture = Gesture::Pending { block, origin };
                    }
                }
                Gesture::Dragging { block } => {
                    self.drop_preview = self.compute_drop(&block, at);
                    self.gesture = Gesture::Dragging { block };
                }
                Gesture::Editing { block } => match self.row_id_at(at.y) {
                    Some(head) if head != block => {
                        self.exit_edit(now);
                        self.range = Some((block.clone(), head.clone()));
                        self.gesture = Gesture::Selecting {
                            anchor: block,
                            head,
                        };
                    }
                    _ => self.gesture = Gesture::Editing { block },
                },
                Gesture::Selecting { anchor, head } => {
                    let head = self.row_id_at(at.y).unwrap_or(head);
                    self.range = Some((anchor.clone(), head.clone()));
                    self.gesture = Gesture::Selecting { anchor, head };
                }
            }
        }

        /// Pointer released. A handle press that never moved is a click and zooms in;
        /// a drag drops where the preview says and starts the click cool-down.
        pub fn pointer_up(&mut self, at: Point, now: Instant) -> bool {
            match std::mem::replace(&mut self.gesture, Gesture::Idle) {
                Gesture::Pending { block, .. } => {
                    if self.in_cooldown(now) {
                        return false;
                    }
                    self.zoom_in(&block, now)
                }
                Gesture::Dragging { block } => {
                    let preview = self
                        .compute_drop(&block, at)
                        .or_else(|| self.drop_preview.take());
                    self.drop_preview = None;
                    self.cooldown_until = Some(now + self.settings.click_cooldown);
                    let Some(preview) = preview else {
                        return false;
                    };
                    if preview.position == DropPosition::Inside {
                        if let Some(target) = self.file.block_mut(&preview.target) {
                            target.collapsed = false;
                        }
                    }
                    let moved = self.execute(
                        EditCommand::ReparentMove {
                            block,
                            parent: preview.parent,
                            index: preview.index,
                        },
                        now,
                    );
                    if !moved {
                        self.relayout();
                    }
                    moved
                }
                Gesture::Idle | Gesture::Editing { .. } | Gesture::Selecting { .. } => false,
            }
        }

        /// Resolve the pointer position to a drop. Top half of a row is "before"; the
        /// bottom half is "after", or "inside" once the pointer is far enough right.
        fn compute_drop(&self, dragged: &BlockId, at: Point) -> Option<DropPreview> {
            let count = self.layout.rows.len();
            if count == 0 {
                return None;
            }
            let ix = self.index_for_y(at.y).min(count - 1);
            let (target, depth) = self.layout.rows[ix].clone();
            if self.file.is_within(&target, dragged) {
                return None;
            }
            let top = self.layout.origins[ix];
            let height = self.layout.origins[ix + 1] - top;
            let indent = depth as f32 * self.settings.indent_width;
            let position = if at.y - top < height / 2.0 {
                DropPosition::Before
            } else if at.x > indent + self.settings.inside_threshold {
                DropPosition::Inside
            } else {
                DropPosition::After
            };

            let block = self.file.block(&target)?;
            let expanded_parent = !block.children.is_empty() && !block.collapsed;
            let (parent, index) = match position {
                DropPosition::Inside => (Some(target.clone()), 0),
                DropPosition::After if expanded_parent => (Some(target.clone()), 0),
                DropPosition::Before | DropPosition::After => {
                    let parent = self.file.parent_of(&target).cloned();
                    let mut index = self.file.index_in_parent(&target)?
                        + usize::from(position == DropPosition::After);
                    let same_parent = self.file.parent_of(dragged) == parent.as_ref();
                    if same_parent
                        && self
                            .file
                            .index_in_parent(dragged)
                            .is_some_and(|d| d < index)
                    {
                        index -= 1;
                    }
                    (parent, index)
                }
            };
            Some(DropPreview {
                target,
                position,
                parent,
                index,
            })
        }

        /* --------------------------- Range selection --------------------------- */

        pub fn select_range(&mut self, anchor: &BlockId, head: &BlockId, now: Instant) -> bool {
            if !self.layout.index.contains_key(anchor) || !self.layout.index.contains_key(head) {
                return false;
            }
            self.exit_edit(now);
            self.range = Some((anchor.clone(), head.clone()));
            true
        }

        pub fn clear_selection(&mut self) {
            self.range = None;
        }

        /// Visible rows between anchor and head, inclusive.
        pub fn selected_blocks(&self) -> Vec<BlockId> {
            match self.range_indices() {
                Some((lo, hi)) => self.layout.rows[lo..=hi]
                    .iter()
                    .map(|(id, _)| id.clone())
                    .collect(),
                None => Vec::new(),
            }
        }

        pub fn copy_selection(&self) -> Option<String> {
            let ids = self.selected_blocks();
            if ids.is_empty() {
                return None;
            }
            Some(format_blocks(
                &self.file,
                &ids,
                &self.settings.format_options(),
            ))
        }

        pub fn delete_selection(&mut self) -> DeleteRequest {
            let ids = self.selected_blocks();
            if ids.is_empty() {
                return DeleteRequest::Nothing;
            }
            self.pending_delete = Some(ids);
            DeleteRequest::NeedsConfirmation
        }

        /* ------------------------------- Delete ------------------------------- */

        /// Empty leaves go at once; anything else waits for [`Self::confirm_delete`].
        pub fn request_delete(&mut self, id: &BlockId, now: Instant) -> DeleteRequest {
            if !self.editable(id) {
                return DeleteRequest::Nothing;
            }
            self.commit(now);
            let empty_leaf = self
                .file
                .block(id)
                .is_some_and(|b| b.text.is_empty() && b.children.is_empty());
            if empty_leaf {
                return match self.execute(EditCommand::Delete { block: id.clone() }, now) {
                    true => DeleteRequest::Deleted,
                    false => DeleteRequest::Nothing,
                };
            }
            self.pending_delete = Some(vec![id.clone()]);
            DeleteRequest::NeedsConfirmation
        }

        pub fn confirm_delete(&mut self, now: Instant) -> bool {
            let Some(ids) = self.pending_delete.take() else {
                return false;
            };
            self.commit(now);
            let mut removed = false;
            for id in ids {
                if self.file.contains(&id) {
                    removed |= self.execute(EditCommand::RemoveSubtree { block: id }, now);
                }
            }
            self.range = None;
            removed
        }

        pub fn cancel_delete(&mut self) {
            self.pending_delete = None;
        }

        /* ----------------------------- Persistence ----------------------------- */

        /// Drive the debounced write; swaps in the re-parsed file after an external edit.
        pub fn tick(&mut self, now: Instant, store: &dyn DocumentStore) -> FlushOutcome {
            let outcome = self.scheduler.poll(now, &self.file, store);
            if let FlushOutcome::Reloaded(file) = &outcome {
                self.replace_file(file.clone());
            }
            outcome
        }

        pub fn on_external_change(&mut self, store: &dyn DocumentStore) -> FlushOutcome {
            let outcome = self.scheduler.on_external_change(store);
            if let FlushOutcome::Reloaded(file) = &outcome {
                self.replace_file(file.clone());
            }
            outcome
        }

        /// Commit and write immediately.
        pub fn close(&mut self, now: Instant, store: &dyn DocumentStore) -> FlushOutcome {
            self.exit_edit(now);
            self.scheduler.flush_now(now, &self.file, store)
        }

        fn replace_file(&mut self, mut file: OutlinerFile) {
            for (id, block) in file.blocks.iter_mut() {
                if self.file.block(id).is_some_and(|b| b.collapsed) {
                    block.collapsed = true;
                }
            }
            self.file = file;
            self.pending_delete = None;
            self.drop_preview = None;
            self.after_change();
        }

        /* ------------------------------- Bridges ------------------------------- */

        pub fn suggestion_context(&self) -> Option<SuggestionContext> {
            let editor = self.editor.as_ref()?;
            bridges::suggestion_context(editor)
        }

        pub fn complete_suggestion(
            &mut self,
            context: &SuggestionContext,
            completion: &str,
            now: Instant,
        ) -> bool {
            let Some(editor) = self.editor.as_mut() else {
                return false;
            };
            bridges::apply_completion(editor, context, completion);
            self.commit(now)
        }

        /// Run another extension's editor command through the gate, then commit.
        pub fn run_editor_command<F>(
            &mut self,
            gate: &CommandGate,
            command: &str,
            provenance: Option<&str>,
            now: Instant,
            f: F,
        ) -> bool
        where
            F: FnOnce(&mut dyn EditorAdapter),
        {
            let Some(editor) = self.editor.as_mut() else {
                return false;
            };
            if !gate.run(command, provenance, editor, f) {
                return false;
            }
            self.commit(now);
            true
        }

        /* ------------------------------ Warnings ------------------------------ */

        pub fn warnings(&self) -> Vec<Banner> {
            self.file
                .warnings()
                .into_iter()
                .map(|(id, warning)| Banner {
                    block: id.clone(),
                    message: warning.message(),
                })
                .collect()
        }
    }

    /// Block text with structural-looking lines escaped so they render as plain text.
    fn display_text(block: &Block) -> String {
        if block.warnings.is_empty() {
            return block.text.clone();
        }
        block
            .text
            .split('\n')
            .enumerate()
            .map(|(n, line)| {
                let flagged = block
                    .warnings
                    .iter()
                    .any(|w| matches!(w, BlockWarning::StructuralText { line: at } if *at == n));
                if flagged {
                    format!("\\{line}")
                } else {
                    line.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::storage::MemoryStore;
        use std::time::Duration;

        fn view(text: &str) -> ViewController {
            ViewController::new(parse_outline(text), "notes", Settings::default())
        }

        fn id(s: &str) -> BlockId {
            BlockId::from(s)
        }

        fn row_ids(view: &ViewController) -> Vec<String> {
            view.rows().into_iter().map(|r| r.id.0).collect()
        }

        fn text_of(view: &ViewController, block: &str) -> String {
            view.file().block(&id(block)).unwrap().text.clone()
        }

        fn ms(n: u64) -> Duration {
            Duration::from_millis(n)
        }

        #[test]
        fn render_window_virtualizes() {
            let text: String = (0..1000).map(|i| format!("- n{i} ^b{i}\n")).collect();
            let mut view = view(&text);
            view.set_viewport(2800.0, 280.0);
            let window = view.render_window();
            assert_eq!(window.rows.len(), 31);
            assert_eq!(window.rows[0].id, id("b90"));
            assert_eq!(window.top_spacer, 90.0 * 28.0);
            assert_eq!(window.bottom_spacer, (1000.0 - 121.0) * 28.0);
            assert_eq!(window.total_height, 1000.0 * 28.0);
        }

        #[test]
        fn measured_heights_shift_rows() {
            let mut view = view("- a ^a\n- b ^b\n");
            view.set_row_height(&id("a"), 60.0);
            let rows = view.rows();
            assert_eq!(rows[1].top, 60.0);
            assert_eq!(rows[1].height, 28.0);
        }

        #[test]
        fn single_active_editor_commits_on_switch() {
            let mut view = view("- a ^a\n- b ^b\n");
            let t0 = Instant::now();
            assert!(view.enter_edit(&id("a"), 0, t0));
            view.editor_mut().unwrap().set_value("alpha");
            assert!(view.enter_edit(&id("b"), 0, t0));
            assert_eq!(view.editor().unwrap().block(), &id("b"));
            assert_eq!(text_of(&view, "a"), "alpha");
            assert!(view.scheduler().dirty().contains(&id("a")));
            let editing: Vec<bool> = view.rows().iter().map(|r| r.editing).collect();
            assert_eq!(editing, vec![false, true]);
        }

        #[test]
        fn enter_splits_and_backspace_merges() {
            let mut view = view("- hello ^a\n");
            let t0 = Instant::now();
            view.enter_edit(&id("a"), 2, t0);
            assert!(view.handle_key(Key::Enter, t0));
            assert_eq!(view.rows().len(), 2);
            assert_eq!(text_of(&view, "a"), "he");
            let editor = view.editor().unwrap();
            assert_ne!(editor.block(), &id("a"));
            assert_eq!((editor.text(), editor.caret()), ("llo", 0));

            assert!(view.handle_key(Key::Backspace, t0));
            assert_eq!(row_ids(&view), vec!["a"]);
            assert_eq!(text_of(&view, "a"), "hello");
            assert_eq!(view.editor().unwrap().caret(), 2);
        }

        #[test]
        fn backspace_on_empty_block_deletes_it() {
            let mut view = view("- a ^a\n- ^b\n- c ^c\n");
            let t0 = Instant::now();
            view.enter_edit(&id("b"), 0, t0);
            assert!(view.handle_key(Key::Backspace, t0));
            assert_eq!(row_ids(&view), vec!["a", "c"]);
            assert_eq!(view.editor().unwrap().block(), &id("c"));
        }

        #[test]
        fn zoom_scopes_rows_and_breadcrumbs() {
            let mut view = view("- a ^a\n\t- b ^b\n\t- c ^c\n- d ^d\n");
            let t0 = Instant::now();
            assert!(view.zoom_in(&id("a"), t0));
            assert_eq!(row_ids(&view), vec!["b", "c"]);
            let labels: Vec<String> = view.breadcrumbs().into_iter().map(|c| c.label).collect();
            assert_eq!(labels, vec!["notes", "a"]);

            view.enter_edit(&id("c"), 1, t0);
            assert!(!view.handle_key(Key::Delete, t0));
            assert!(!view.enter_edit(&id("d"), 0, t0));

            assert!(view.pop_to(0, t0));
            assert_eq!(row_ids(&view), vec!["a", "b", "c", "d"]);
            assert!(view.editor().is_none());
            assert!(!view.zoom_out(t0));
        }

        #[test]
        fn collapse_hides_rows_not_blocks() {
            let mut view = view("- a ^a\n\t- b ^b\n- c ^c\n");
            let t0 = Instant::now();
            view.enter_edit(&id("b"), 0, t0);
            assert!(view.toggle_collapse(&id("a"), t0));
            assert_eq!(row_ids(&view), vec!["a", "c"]);
            assert!(view.rows()[0].collapsed);
            assert!(view.editor().is_none());
            assert_eq!(view.file().len(), 3);
            assert!(view.toggle_collapse(&id("a"), t0));
            assert_eq!(row_ids(&view), vec!["a", "b", "c"]);
            assert!(!view.toggle_collapse(&id("c"), t0));
        }

        #[test]
        fn drag_classifies_drop_positions() {
            let mut view = view("- a ^a\n- b ^b\n- c ^c\n");
            let t0 = Instant::now();
            assert!(view.handle_pointer_down(&id("a"), Point::new(10.0, 10.0)));

            view.pointer_move(Point::new(10.0, 40.0), t0);
            let before = view.drop_preview().cloned().expect("preview");
            assert_eq!(
                (before.target.clone(), before.position, before.parent, before.index),
                (id("b"), DropPosition::Before, None, 0)
            );

            view.pointer_move(Point::new(10.0, 50.0), t0);
            let after = view.drop_preview().cloned().expect("preview");
            assert_eq!((after.position, after.index), (DropPosition::After, 1));

            view.pointer_move(Point::new(60.0, 50.0), t0);
            let inside = view.drop_preview().cloned().expect("preview");
            assert_eq!(
                (inside.position, inside.parent, inside.index),
                (DropPosition::Inside, Some(id("b")), 0)
            );

            assert!(view.pointer_up(Point::new(60.0, 50.0), t0));
            assert_eq!(row_ids(&view), vec!["b", "a", "c"]);
            assert_eq!(view.file().parent_of(&id("a")), Some(&id("b")));
            assert!(view.drop_preview().is_none());

            assert!(!view.text_pointer_down(&id("c"), 0, t0 + ms(100)));
            assert!(view.text_pointer_down(&id("c"), 0, t0 + ms(400)));
        }

        #[test]
        fn drop_onto_own_subtree_is_rejected() {
            let mut view = view("- a ^a\n\t- b ^b\n- c ^c\n");
            let t0 = Instant::now();
            view.handle_pointer_down(&id("a"), Point::new(0.0, 5.0));
            view.pointer_move(Point::new(60.0, 50.0), t0);
            assert!(view.drop_preview().is_none());
            assert!(!view.pointer_up(Point::new(60.0, 50.0), t0));
            assert_eq!(view.file().parent_of(&id("b")), Some(&id("a")));
        }

        #[test]
        fn handle_click_zooms_in() {
            let mut view = view("- a ^a\n\t- b ^b\n");
            let t0 = Instant::now();
            view.handle_pointer_down(&id("a"), Point::new(0.0, 5.0));
            view.pointer_move(Point::new(1.0, 6.0), t0);
            assert!(view.pointer_up(Point::new(1.0, 6.0), t0));
            assert_eq!(view.scope(), Some(&id("a")));
        }

        #[test]
        fn range_selection_copy_and_delete() {
            let mut view = view("- a ^a\n- b ^b\n- c ^c\n- d ^d\n");
            let t0 = Instant::now();
            assert!(view.text_pointer_down(&id("a"), 0, t0));
            view.pointer_move(Point::new(10.0, 60.0), t0);
            assert!(view.editor().is_none());
            assert_eq!(view.selected_blocks(), vec![id("a"), id("b"), id("c")]);
            let selected: Vec<bool> = view.rows().iter().map(|r| r.selected).collect();
            assert_eq!(selected, vec![true, true, true, false]);
            view.pointer_up(Point::new(10.0, 60.0), t0);

            let copied = view.copy_selection().expect("copy");
            assert!(copied.contains("^a\n") && copied.contains("^c\n"));
            assert!(!copied.contains("^d"));

            assert_eq!(view.delete_selection(), DeleteRequest::NeedsConfirmation);
            assert!(view.confirm_delete(t0));
            assert_eq!(row_ids(&view), vec!["d"]);
            assert!(view.selected_blocks().is_empty());
        }

        #[test]
        fn delete_needs_confirmation_for_content() {
            let mut view = view("- a ^a\n\t- kid ^k\n- ^e\n- z ^z\n");
            let t0 = Instant::now();
            assert_eq!(view.request_delete(&id("a"), t0), DeleteRequest::NeedsConfirmation);
            view.cancel_delete();
            assert!(!view.confirm_delete(t0));
            assert_eq!(view.file().len(), 4);

            view.request_delete(&id("a"), t0);
            assert!(view.confirm_delete(t0));
            assert_eq!(row_ids(&view), vec!["e", "z"]);
            assert_eq!(view.request_delete(&id("e"), t0), DeleteRequest::Deleted);
            assert_eq!(row_ids(&view), vec!["z"]);
        }

        #[test]
        fn paste_and_task_keys() {
            let mut view = view("- ^x\n");
            let t0 = Instant::now();
            view.enter_edit(&id("x"), 0, t0);
            assert!(view.paste("one\ntwo", false, t0));
            assert_eq!(view.rows().len(), 2);
            assert_eq!(view.editor().unwrap().caret(), 3);

            let mut literal = self::view("- ^x\n");
            literal.enter_edit(&id("x"), 0, t0);
            assert!(literal.paste("one\ntwo", true, t0));
            assert_eq!(literal.rows().len(), 1);

            let mut single = self::view("- ^y\n");
            single.enter_edit(&id("y"), 0, t0);
            assert!(single.paste("  - item", false, t0));
            assert_eq!(text_of(&single, "y"), "item");
            assert!(single.paste(" - raw", true, t0));
            assert_eq!(text_of(&single, "y"), "item - raw");

            let mut tasks = self::view("- hello ^a\n");
            tasks.enter_edit(&id("a"), 2, t0);
            assert!(tasks.handle_key(Key::ToggleTask, t0));
            assert_eq!(text_of(&tasks, "a"), "[ ] hello");
            assert_eq!(tasks.editor().unwrap().caret(), 6);
            assert!(tasks.handle_key(Key::ToggleTaskStatus, t0));
            assert_eq!(text_of(&tasks, "a"), "[x] hello");
        }

        #[test]
        fn arrows_walk_visible_rows() {
            let mut view = view("- abc ^a\n- de ^b\n");
            let t0 = Instant::now();
            view.enter_edit(&id("a"), 3, t0);
            assert!(view.handle_key(Key::ArrowDown, t0));
            let editor = view.editor().unwrap();
            assert_eq!((editor.block(), editor.caret()), (&id("b"), 2));
            assert!(!view.handle_key(Key::ArrowDown, t0));
            assert!(view.handle_key(Key::ArrowUp, t0));
            assert_eq!(view.editor().unwrap().block(), &id("a"));
        }

        #[test]
        fn structural_warnings_surface_in_rows() {
            let view = view("- item\n  # heading ^a\n");
            let row = &view.rows()[0];
            assert!(row.warning);
            assert_eq!(row.display, "item\n\\# heading");
            assert_eq!(view.warnings().len(), 1);
        }

        #[test]
        fn bridges_drive_the_active_editor() {
            let mut view = view("- see ^a\n");
            let t0 = Instant::now();
            view.enter_edit(&id("a"), 3, t0);
            assert!(view.input("see [[Pro", 9, t0));
            let ctx = view.suggestion_context().expect("link trigger");
            assert!(view.complete_suggestion(&ctx, "Project", t0));
            assert_eq!(text_of(&view, "a"), "see [[Project]]");

            let gate = CommandGate::new(&Settings::default()).expect("gate");
            let blocked = view.run_editor_command(&gate, "x", Some("plugin:tasks:1:1"), t0, |e| {
                e.set_value("hijacked")
            });
            assert!(!blocked);
            let ours = view.run_editor_command(&gate, "upper", Some("plugin:outliner:1:1"), t0, |e| {
                let upper = e.value().to_uppercase();
                e.set_value(&upper)
            });
            assert!(ours);
            assert_eq!(text_of(&view, "a"), "SEE [[PROJECT]]");
        }

        #[test]
        fn tick_writes_and_reloads() {
            let store = MemoryStore::new("notes", "- a ^a\n");
            let mut view = ViewController::open(&store, Settings::default()).expect("open");
            let t0 = Instant::now();
            view.enter_edit(&id("a"), 0, t0);
            assert!(view.input("changed", 7, t0));
            assert!(matches!(view.tick(t0 + ms(100), &store), FlushOutcome::Idle));
            assert!(matches!(view.tick(t0 + ms(800), &store), FlushOutcome::Written));
            assert!(store.contents().starts_with("- changed\n"));

            store.replace_externally("- fresh ^a\n- more ^m\n");
            assert!(matches!(
                view.tick(t0 + ms(900), &store),
                FlushOutcome::Reloaded(_)
            ));
            assert_eq!(row_ids(&view), vec!["a", "m"]);
            assert_eq!(view.editor().unwrap().text(), "fresh");
        }
    }
}

pub mod bridges {
    //! Seams through which the host's suggestion UI and other extensions reach the
    //! single active editor. Everything another extension contributes passes the
    //! allow-list; anything that cannot be attributed to an owner is refused.

    use super::config::{FIRST_PARTY_ID, Settings};
    use super::core::byte_offset;
    use super::view::Point;
    use anyhow::{Context, Result};
    use regex::Regex;
    use std::collections::{HashMap, HashSet};
    use std::ops::Range;

    /* ------------------------------ Adapter ------------------------------ */

    /// What a bridge may do to the active editor. Offsets are characters.
    pub trait EditorAdapter {
        fn value(&self) -> String;
        fn set_value(&mut self, value: &str);
        fn cursor(&self) -> usize;
        fn set_cursor(&mut self, offset: usize);
        fn selection(&self) -> Option<(usize, usize)>;
        fn set_selection(&mut self, selection: Option<(usize, usize)>);
        /// Screen position of the caret placed at `offset`.
        fn coords_at(&self, offset: usize) -> Point;
    }

    /* ---------------------------- Suggestions ---------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Trigger {
        /// `[[query`
        Link,
        /// `/query` at line start or after whitespace
        Slash,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct SuggestionContext {
        pub trigger: Trigger,
        pub query: String,
        /// Characters replaced by a completion: trigger start up to the cursor.
        pub replace: Range<usize>,
        /// Where the host should anchor its popup.
        pub anchor: Point,
    }

    /// Open suggestion, if the text before the cursor ends in a trigger.
    pub fn suggestion_context(editor: &dyn EditorAdapter) -> Option<SuggestionContext> {
        if editor.selection().is_some_and(|(a, h)| a != h) {
            return None;
        }
        let value = editor.value();
        let cursor = editor.cursor();
        let before: Vec<char> = value.chars().take(cursor).collect();
        if before.len() < cursor {
            return None;
        }

        let link = link_start(&before).map(|start| (Trigger::Link, start, start + 2));
        let slash = slash_start(&before).map(|start| (Trigger::Slash, start, start + 1));
        let (trigger, start, query_start) = match (link, slash) {
            (Some(l), Some(s)) => {
                if s.1 > l.1 {
                    s
                } else {
                    l
                }
            }
            (l, s) => l.or(s)?,
        };
        Some(SuggestionContext {
            trigger,
            query: before[query_start..].iter().collect(),
            replace: start..cursor,
            anchor: editor.coords_at(start),
        })
    }

    fn link_start(before: &[char]) -> Option<usize> {
        let start = (0..before.len().saturating_sub(1))
            .rev()
            .find(|&i| before[i] == '[' && before[i + 1] == '[')?;
        let query = &before[start + 2..];
        let closed = query.windows(2).any(|w| w[0] == ']' && w[1] == ']');
        if closed || query.contains(&'\n') {
            return None;
        }
        Some(start)
    }

    fn slash_start(before: &[char]) -> Option<usize> {
        let start = before.iter().rposition(|&c| c == '/')?;
        if before[start + 1..].iter().any(|c| c.is_whitespace()) {
            return None;
        }
        match start.checked_sub(1).map(|i| before[i]) {
            None => Some(start),
            Some(c) if c.is_whitespace() => Some(start),
            Some(_) => None,
        }
    }

    /// Replace the trigger and query with the chosen completion. Link completions are
    /// wrapped in brackets, swallowing a `]]` the editor may already have closed.
    pub fn apply_completion(
        editor: &mut dyn EditorAdapter,
        context: &SuggestionContext,
        completion: &str,
    ) {
        let value = editor.value();
        let start = byte_offset(&value, context.replace.start);
        let mut end = byte_offset(&value, context.replace.end);
        let insert = match context.trigger {
            Trigger::Link => {
                if value[end..].starts_with("]]") {
                    end += 2;
                }
                format!("[[{completion}]]")
            }
            Trigger::Slash => completion.to_string(),
        };
        let next = format!("{}{}{}", &value[..start], insert, &value[end..]);
        editor.set_value(&next);
        editor.set_cursor(context.replace.start + insert.chars().count());
    }

    /* ----------------------------- Attribution ----------------------------- */

    /// Explicit owners, keyed by command or menu action id.
    #[derive(Debug, Default, Clone)]
    pub struct OwnershipRegistry {
        owners: HashMap<String, String>,
    }

    impl OwnershipRegistry {
        pub fn register(&mut self, key: &str, owner: &str) {
            self.owners.insert(key.to_string(), owner.to_string());
        }

        pub fn owner(&self, key: &str) -> Option<&str> {
            self.owners.get(key).map(String::as_str)
        }

        /// Forget everything an extension registered, e.g. when it unloads.
        pub fn forget_owner(&mut self, owner: &str) {
            self.owners.retain(|_, o| o != owner);
        }
    }

    const PROVENANCE_PATTERN: &str = r"(?:plugin:|(?:plugins|extensions)[/\\])([A-Za-z0-9_.-]+)";

    /// Fallback attribution: find extension ids in a provenance string such as a
    /// captured call stack.
    #[derive(Debug, Clone)]
    pub struct ProvenanceShim {
        pattern: Regex,
    }

    impl ProvenanceShim {
        pub fn new() -> Result<Self> {
            Self::with_pattern(PROVENANCE_PATTERN)
        }

        /// The pattern's first capture group is the extension id.
        pub fn with_pattern(pattern: &str) -> Result<Self> {
            let pattern = Regex::new(pattern)
                .with_context(|| format!("compiling provenance pattern {pattern:?}"))?;
            Ok(Self { pattern })
        }

        /// The first extension other than ours named in `provenance`; ours if it is
        /// the only one; `None` when nothing matches.
        pub fn attribute(&self, provenance: &str) -> Option<String> {
            let mut ours = false;
            for caps in self.pattern.captures_iter(provenance) {
                let Some(id) = caps.get(1).map(|m| m.as_str()) else {
                    continue;
                };
                if id == FIRST_PARTY_ID {
                    ours = true;
                } else {
                    return Some(id.to_string());
                }
            }
            ours.then(|| FIRST_PARTY_ID.to_string())
        }
    }

    /* --------------------------- Command gate --------------------------- */

    /// Decides whether an editor-scoped command may run against the active editor.
    #[derive(Debug, Clone)]
    pub struct CommandGate {
        settings: Settings,
        registry: OwnershipRegistry,
        shim: ProvenanceShim,
    }

    impl CommandGate {
        pub fn new(settings: &Settings) -> Result<Self> {
            Ok(Self {
                settings: settings.clone(),
                registry: OwnershipRegistry::default(),
                shim: ProvenanceShim::new()?,
            })
        }

        pub fn registry(&self) -> &OwnershipRegistry {
            &self.registry
        }

        pub fn registry_mut(&mut self) -> &mut OwnershipRegistry {
            &mut self.registry
        }

        pub fn update_settings(&mut self, settings: &Settings) {
            self.settings = settings.clone();
        }

        /// Registry first, provenance second.
        pub fn owner_of(&self, key: &str, provenance: Option<&str>) -> Option<String> {
            if let Some(owner) = self.registry.owner(key) {
                return Some(owner.to_string());
            }
            provenance.and_then(|p| self.shim.attribute(p))
        }

        pub fn allows(&self, command: &str, provenance: Option<&str>) -> bool {
            match self.owner_of(command, provenance) {
                Some(owner) => {
                    let allowed = self.settings.allows(&owner);
                    if !allowed {
                        tracing::debug!(%command, %owner, "command blocked by allow-list");
                    }
                    allowed
                }
                None => {
                    tracing::debug!(%command, "command blocked: no owner");
                    false
                }
            }
        }

        /// Run `command` against the editor if its owner is allowed.
        pub fn run<F>(
            &self,
            command: &str,
            provenance: Option<&str>,
            editor: &mut dyn EditorAdapter,
            f: F,
        ) -> bool
        where
            F: FnOnce(&mut dyn EditorAdapter),
        {
            if !self.allows(command, provenance) {
                return false;
            }
            f(editor);
            true
        }
    }

    /* ------------------------------ Menu ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct MenuItem {
        pub action: String,
        pub title: String,
    }

    impl MenuItem {
        pub fn new(action: &str, title: &str) -> Self {
            Self {
                action: action.to_string(),
                title: title.to_string(),
            }
        }
    }

    /// An item another extension offered, with whatever we know about its origin.
    #[derive(Debug, Clone)]
    pub struct Contribution {
        pub item: MenuItem,
        pub provenance: Option<String>,
    }

    /// Builds the block context menu: built-ins first, then allowed contributions.
    #[derive(Debug, Clone, Default)]
    pub struct MenuBridge {
        builtins: Vec<MenuItem>,
    }

    impl MenuBridge {
        pub fn new(builtins: Vec<MenuItem>) -> Self {
            Self { builtins }
        }

        pub fn compose(&self, gate: &CommandGate, contributions: &[Contribution]) -> Vec<MenuItem> {
            let mut seen = HashSet::new();
            let mut items = Vec::new();
            for item in &self.builtins {
                if seen.insert(item.action.clone()) {
                    items.push(item.clone());
                }
            }
            for c in contributions {
                if !gate.allows(&c.item.action, c.provenance.as_deref()) {
                    continue;
                }
                if seen.insert(c.item.action.clone()) {
                    items.push(c.item.clone());
                }
            }
            items
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        struct Buffer {
            value: String,
            cursor: usize,
            selection: Option<(usize, usize)>,
        }

        impl Buffer {
            fn at(value: &str, cursor: usize) -> Self {
                Self {
                    value: value.to_string(),
                    cursor,
                    selection: None,
                }
            }
        }

        impl EditorAdapter for Buffer {
            fn value(&self) -> String {
                self.value.clone()
            }
            fn set_value(&mut self, value: &str) {
                self.value = value.to_string();
            }
            fn cursor(&self) -> usize {
                self.cursor
            }
            fn set_cursor(&mut self, offset: usize) {
                self.cursor = offset;
            }
            fn selection(&self) -> Option<(usize, usize)> {
                self.selection
            }
            fn set_selection(&mut self, selection: Option<(usize, usize)>) {
                self.selection = selection;
            }
            fn coords_at(&self, offset: usize) -> Point {
                Point::new(offset as f32 * 10.0, 0.0)
            }
        }

        fn gate(enabled: bool, allowed: &[&str]) -> CommandGate {
            let settings = Settings {
                bridges_enabled: enabled,
                allowed_extensions: allowed.iter().map(|s| s.to_string()).collect(),
                ..Settings::default()
            };
            CommandGate::new(&settings).expect("gate")
        }

        #[test]
        fn link_trigger_and_completion() {
            let mut buf = Buffer::at("see [[Pro", 9);
            let ctx = suggestion_context(&buf).expect("link");
            assert_eq!(ctx.trigger, Trigger::Link);
            assert_eq!(ctx.query, "Pro");
            assert_eq!(ctx.replace, 4..9);
            assert_eq!(ctx.anchor, Point::new(40.0, 0.0));

            apply_completion(&mut buf, &ctx, "Project");
            assert_eq!(buf.value, "see [[Project]]");
            assert_eq!(buf.cursor, 15);

            let mut closed = Buffer::at("[[Pr]] tail", 4);
            let ctx = suggestion_context(&closed).expect("link");
            apply_completion(&mut closed, &ctx, "Project");
            assert_eq!(closed.value, "[[Project]] tail");

            assert!(suggestion_context(&Buffer::at("[[done]] x", 10)).is_none());
        }

        #[test]
        fn slash_trigger_needs_word_boundary() {
            let mut buf = Buffer::at("a /to", 5);
            let ctx = suggestion_context(&buf).expect("slash");
            assert_eq!((ctx.trigger, ctx.query.as_str()), (Trigger::Slash, "to"));
            assert_eq!(ctx.replace, 2..5);
            apply_completion(&mut buf, &ctx, "[ ] ");
            assert_eq!(buf.value, "a [ ] ");

            assert!(suggestion_context(&Buffer::at("/", 1)).is_some());
            assert!(suggestion_context(&Buffer::at("a/b", 3)).is_none());
            assert!(suggestion_context(&Buffer::at("/to do", 6)).is_none());

            let mut selected = Buffer::at("a /to", 5);
            selected.selection = Some((2, 5));
            assert!(suggestion_context(&selected).is_none());
        }

        #[test]
        fn provenance_attribution() {
            let shim = ProvenanceShim::new().expect("shim");
            let stack = "at run (app://host/plugins/outliner/main.js:10:2)\n\
                         at register (app://host/plugins/tasks/main.js:3:1)";
            assert_eq!(shim.attribute(stack).as_deref(), Some("tasks"));
            assert_eq!(shim.attribute("at x (plugin:calendar:12:3)").as_deref(), Some("calendar"));
            assert_eq!(
                shim.attribute("at y (app://host/plugins/outliner/main.js:1:1)").as_deref(),
                Some(FIRST_PARTY_ID)
            );
            assert_eq!(shim.attribute("at z (app://host/core.js:1:1)"), None);
        }

        #[test]
        fn gate_fails_closed() {
            let mut gate = gate(false, &["tasks"]);
            gate.registry_mut().register("outliner:indent", FIRST_PARTY_ID);
            gate.registry_mut().register("tasks:toggle", "tasks");

            assert!(gate.allows("outliner:indent", None));
            assert!(!gate.allows("tasks:toggle", None));
            assert!(!gate.allows("mystery", None));
            assert!(!gate.allows("mystery", Some("at q (app://host/core.js)")));

            gate.update_settings(&Settings {
                bridges_enabled: true,
                allowed_extensions: vec!["tasks".to_string()],
                ..Settings::default()
            });
            assert!(gate.allows("tasks:toggle", None));
            assert!(gate.allows("other", Some("plugin:tasks:1:1")));
            assert!(!gate.allows("other", Some("plugin:calendar:1:1")));

            let mut buf = Buffer::at("x", 1);
            assert!(gate.run("tasks:toggle", None, &mut buf, |e| e.set_value("[ ] x")));
            assert_eq!(buf.value, "[ ] x");
            assert!(!gate.run("mystery", None, &mut buf, |e| e.set_value("nope")));
            assert_eq!(buf.value, "[ ] x");

            gate.registry_mut().forget_owner("tasks");
            assert!(gate.registry().owner("tasks:toggle").is_none());
        }

        #[test]
        fn menu_merges_allowed_contributions() {
            let gate = gate(true, &["tasks"]);
            let bridge = MenuBridge::new(vec![
                MenuItem::new("zoom", "Zoom in"),
                MenuItem::new("delete", "Delete"),
            ]);
            let offered = |action: &str, title: &str, provenance: Option<&str>| Contribution {
                item: MenuItem::new(action, title),
                provenance: provenance.map(str::to_string),
            };
            let contributions = vec![
                offered("tasks:schedule", "Schedule", Some("plugin:tasks:1:1")),
                offered("calendar:open", "Open day", Some("plugin:calendar:1:1")),
                offered("anon", "Anonymous", None),
                offered("delete", "Delete forever", Some("plugin:tasks:1:1")),
                offered("tasks:schedule", "Schedule again", Some("plugin:tasks:2:1")),
            ];
            let titles: Vec<String> = bridge
                .compose(&gate, &contributions)
                .into_iter()
                .map(|i| i.title)
                .collect();
            assert_eq!(titles, vec!["Zoom in", "Delete", "Schedule"]);
        }
    }
}

pub use format::{anchor_index, format_outline, format_outline_with};
pub use parser::{NomOutlineParser, parse_outline};
pub use view::ViewController;
