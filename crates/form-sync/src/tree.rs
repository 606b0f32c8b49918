//! Document tree: sections → rows → fields.
//!
//! The tree is arena-style. Fields live in a map keyed by [`FieldId`], and the
//! section/row layout only references ids. Moving a field is then a matter of
//! detaching an id from one row and inserting it into another, never pointer
//! surgery.
//!
//! Structural invariants:
//! - at least one section exists;
//! - a row holds 1..=[`MAX_ROW_FIELDS`] fields (empty rows are pruned);
//! - every id in a row has an entry in the field arena and vice versa;
//! - row ids are scoped to their section.
//!
//! Rows are not edited in place. Every field remembers the row it was put in
//! and the stamp of the write that put it there, and each change re-lays the
//! section out from those claims (see [`Section`]). Which row a field ends up
//! in, and the order of rows, is then a function of the claims alone, so it
//! is the same on every replica whatever order the writes arrived in.
//!
//! The tree itself has no conflict logic. See [`crate::mutator`] for how
//! operations change it.

use crate::ids::{FieldId, RowId, SectionId, DERIVED_ROW_PREFIX};
use crate::mutator::MutationError;
use crate::operation::Stamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum number of side-by-side fields in one row.
pub const MAX_ROW_FIELDS: usize = 4;

/// Field type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    #[serde(alias = "text")]
    ShortText,
    LongText,
    Number,
    Email,
    Phone,
    SingleChoice,
    MultiChoice,
    Checkbox,
    Date,
    File,
    Signature,
    Heading,
    Paragraph,
    Divider,
}

impl FieldKind {
    /// Choice kinds carry an option list.
    pub fn has_options(self) -> bool {
        matches!(self, FieldKind::SingleChoice | FieldKind::MultiChoice)
    }

    /// Layout-only kinds collect no input.
    pub fn is_layout(self) -> bool {
        matches!(self, FieldKind::Heading | FieldKind::Paragraph | FieldKind::Divider)
    }

    /// Label given to a freshly added field of this kind.
    pub fn default_label(self) -> &'static str {
        match self {
            FieldKind::ShortText => "Short answer",
            FieldKind::LongText => "Long answer",
            FieldKind::Number => "Number",
            FieldKind::Email => "Email",
            FieldKind::Phone => "Phone",
            FieldKind::SingleChoice => "Choose one",
            FieldKind::MultiChoice => "Choose any",
            FieldKind::Checkbox => "Checkbox",
            FieldKind::Date => "Date",
            FieldKind::File => "File upload",
            FieldKind::Signature => "Signature",
            FieldKind::Heading => "Heading",
            FieldKind::Paragraph => "Paragraph",
            FieldKind::Divider => "",
        }
    }
}

/// A single form field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub id: FieldId,
    #[serde(rename = "type")]
    pub kind: FieldKind,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub required: bool,
    /// Option values, in display order. Only meaningful for choice kinds.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub placeholder: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub help_text: String,
}

impl Field {
    /// Create a field with the kind's default label (and two starter options
    /// for choice kinds).
    pub fn new(id: FieldId, kind: FieldKind) -> Self {
        let options = if kind.has_options() {
            vec!["Option 1".to_string(), "Option 2".to_string()]
        } else {
            Vec::new()
        };
        Self {
            id,
            kind,
            label: kind.default_label().to_string(),
            required: false,
            options,
            placeholder: String::new(),
            help_text: String::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    /// Whether a respondent must fill this field in.
    ///
    /// Layout-only fields are never required, whatever the stored flag says.
    /// The flag is kept as written so that concurrent kind/required edits
    /// converge regardless of order.
    pub fn is_required(&self) -> bool {
        self.required && !self.kind.is_layout()
    }
}

/// An attribute of a field: the key of a last-writer-wins register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Attribute {
    Kind,
    Label,
    Required,
    Options,
    Placeholder,
    HelpText,
}

impl Attribute {
    pub const ALL: [Attribute; 6] = [
        Attribute::Kind,
        Attribute::Label,
        Attribute::Required,
        Attribute::Options,
        Attribute::Placeholder,
        Attribute::HelpText,
    ];
}

/// Partial update of a field's attributes. `None` leaves an attribute alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldPatch {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FieldKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help_text: Option<String>,
}

impl FieldPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kind(mut self, kind: FieldKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_required(mut self, required: bool) -> Self {
        self.required = Some(required);
        self
    }

    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = Some(options.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_placeholder(mut self, placeholder: impl Into<String>) -> Self {
        self.placeholder = Some(placeholder.into());
        self
    }

    pub fn with_help_text(mut self, help_text: impl Into<String>) -> Self {
        self.help_text = Some(help_text.into());
        self
    }

    /// A patch holding every attribute of `field`.
    pub fn from_field(field: &Field) -> Self {
        Self::capture(field, Attribute::ALL)
    }

    /// A patch holding the current values of `attributes` in `field`.
    pub fn capture(field: &Field, attributes: impl IntoIterator<Item = Attribute>) -> Self {
        let mut patch = Self::default();
        for attribute in attributes {
            patch.copy_from_field(attribute, field);
        }
        patch
    }

    pub fn is_empty(&self) -> bool {
        self.attributes().is_empty()
    }

    pub fn contains(&self, attribute: Attribute) -> bool {
        match attribute {
            Attribute::Kind => self.kind.is_some(),
            Attribute::Label => self.label.is_some(),
            Attribute::Required => self.required.is_some(),
            Attribute::Options => self.options.is_some(),
            Attribute::Placeholder => self.placeholder.is_some(),
            Attribute::HelpText => self.help_text.is_some(),
        }
    }

    /// Attributes this patch sets, in [`Attribute::ALL`] order.
    pub fn attributes(&self) -> Vec<Attribute> {
        Attribute::ALL
            .into_iter()
            .filter(|attribute| self.contains(*attribute))
            .collect()
    }

    pub fn clear(&mut self, attribute: Attribute) {
        match attribute {
            Attribute::Kind => self.kind = None,
            Attribute::Label => self.label = None,
            Attribute::Required => self.required = None,
            Attribute::Options => self.options = None,
            Attribute::Placeholder => self.placeholder = None,
            Attribute::HelpText => self.help_text = None,
        }
    }

    /// Keep only the attributes for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(Attribute) -> bool) {
        for attribute in self.attributes() {
            if !keep(attribute) {
                self.clear(attribute);
            }
        }
    }

    /// Overwrite attributes of `self` with those set in `other`.
    pub fn merge(&mut self, other: &FieldPatch) {
        if let Some(kind) = other.kind {
            self.kind = Some(kind);
        }
        if let Some(label) = &other.label {
            self.label = Some(label.clone());
        }
        if let Some(required) = other.required {
            self.required = Some(required);
        }
        if let Some(options) = &other.options {
            self.options = Some(options.clone());
        }
        if let Some(placeholder) = &other.placeholder {
            self.placeholder = Some(placeholder.clone());
        }
        if let Some(help_text) = &other.help_text {
            self.help_text = Some(help_text.clone());
        }
    }

    /// Set `attribute` to its value in `field`.
    pub fn copy_from_field(&mut self, attribute: Attribute, field: &Field) {
        match attribute {
            Attribute::Kind => self.kind = Some(field.kind),
            Attribute::Label => self.label = Some(field.label.clone()),
            Attribute::Required => self.required = Some(field.required),
            Attribute::Options => self.options = Some(field.options.clone()),
            Attribute::Placeholder => self.placeholder = Some(field.placeholder.clone()),
            Attribute::HelpText => self.help_text = Some(field.help_text.clone()),
        }
    }

    /// Write every set attribute into `field`.
    pub fn apply_to(&self, field: &mut Field) {
        if let Some(kind) = self.kind {
            field.kind = kind;
        }
        if let Some(label) = &self.label {
            field.label = label.clone();
        }
        if let Some(required) = self.required {
            field.required = required;
        }
        if let Some(options) = &self.options {
            field.options = options.clone();
        }
        if let Some(placeholder) = &self.placeholder {
            field.placeholder = placeholder.clone();
        }
        if let Some(help_text) = &self.help_text {
            field.help_text = help_text.clone();
        }
    }
}

/// Where a field goes: a section, optionally a row, optionally a position
/// inside that row.
///
/// `row_id: None` asks for a new row. `index: None` appends. Out-of-range
/// indices are clamped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    pub section_id: SectionId,
    #[serde(default)]
    pub row_id: Option<RowId>,
    #[serde(default)]
    pub index: Option<usize>,
}

impl Placement {
    /// A new row at the end of `section_id`.
    pub fn new_row(section_id: SectionId) -> Self {
        Self {
            section_id,
            row_id: None,
            index: None,
        }
    }

    /// Position `index` inside an existing row.
    pub fn in_row(section_id: SectionId, row_id: RowId, index: usize) -> Self {
        Self {
            section_id,
            row_id: Some(row_id),
            index: Some(index),
        }
    }
}

/// A row of up to [`MAX_ROW_FIELDS`] side-by-side fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    pub id: RowId,
    pub fields: Vec<FieldId>,
}

/// Sort key of an overflow chain inside a section.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum ChainRank<'a> {
    /// Row of the starting document, by its position there.
    Seeded(usize),
    /// Row named by an operation, by id.
    Named(&'a str),
    /// Row created by an operation, by derived id (creation order).
    Derived(&'a str),
}

/// The row a field was placed into and the stamp of the write that placed it.
/// Fields of the starting document carry no stamp and sort first.
#[derive(Debug, Clone)]
struct Claim {
    row: RowId,
    stamp: Option<Stamp>,
}

/// A field waiting for a slot while a section is laid out.
struct Member {
    field_id: FieldId,
    depth: usize,
    stamp: Option<Stamp>,
    position: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    pub id: SectionId,
    pub title: String,
    #[serde(default)]
    pub rows: Vec<Row>,
    /// Rows of the starting document, in order. Kept after they are pruned so
    /// a recreated row returns to its place.
    #[serde(skip)]
    anchors: Vec<String>,
}

impl PartialEq for Section {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.title == other.title && self.rows == other.rows
    }
}

impl Eq for Section {}

impl Section {
    pub fn new(id: SectionId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            rows: Vec::new(),
            anchors: Vec::new(),
        }
    }

    pub fn row(&self, row_id: &RowId) -> Option<&Row> {
        self.rows.iter().find(|row| &row.id == row_id)
    }

    /// Field ids in reading order (row by row, left to right).
    pub fn field_ids(&self) -> impl Iterator<Item = &FieldId> {
        self.rows.iter().flat_map(|row| row.fields.iter())
    }

    fn anchor_rows(&mut self) {
        self.anchors.clear();
        for row in &self.rows {
            let (base, _) = row.id.chain_position();
            if !self.anchors.iter().any(|anchor| anchor == base) {
                self.anchors.push(base.to_string());
            }
        }
    }

    fn row_key<'a>(&self, row_id: &'a RowId) -> (ChainRank<'a>, usize) {
        let (base, depth) = row_id.chain_position();
        let rank = match self.anchors.iter().position(|anchor| anchor == base) {
            Some(position) => ChainRank::Seeded(position),
            None if base.starts_with(DERIVED_ROW_PREFIX) => ChainRank::Derived(base),
            None => ChainRank::Named(base),
        };
        (rank, depth)
    }

    /// Rebuild the rows from the claims of the fields they hold.
    ///
    /// Fields claiming rows of the same overflow chain share its slots: the
    /// shallowest claims first, then the oldest stamps, then field ids. Each
    /// run of [`MAX_ROW_FIELDS`] fills the next row down the chain. Inside a
    /// row, fields keep their current reading order. Empty rows disappear.
    fn settle(&mut self, claims: &BTreeMap<FieldId, Claim>) {
        let mut chains: BTreeMap<String, Vec<Member>> = BTreeMap::new();
        let reading = self
            .rows
            .iter()
            .flat_map(|row| row.fields.iter().map(move |field_id| (field_id, &row.id)));
        for (position, (field_id, current)) in reading.enumerate() {
            let (row, stamp) = match claims.get(field_id) {
                Some(claim) => (&claim.row, claim.stamp.clone()),
                None => (current, None),
            };
            let (base, depth) = row.chain_position();
            chains.entry(base.to_string()).or_default().push(Member {
                field_id: field_id.clone(),
                depth,
                stamp,
                position,
            });
        }

        let mut rows = Vec::new();
        for (base, mut members) in chains {
            members.sort_by(|a, b| {
                (a.depth, &a.stamp, &a.field_id).cmp(&(b.depth, &b.stamp, &b.field_id))
            });
            for (depth, run) in members.chunks_mut(MAX_ROW_FIELDS).enumerate() {
                run.sort_by_key(|member| member.position);
                rows.push(Row {
                    id: RowId::in_chain(&base, depth),
                    fields: run.iter().map(|member| member.field_id.clone()).collect(),
                });
            }
        }
        rows.sort_by(|a, b| self.row_key(&a.id).cmp(&self.row_key(&b.id)));
        self.rows = rows;
    }
}

/// The root aggregate: ordered sections plus the field arena.
///
/// Two trees are equal when they hold the same document. How each field came
/// to be in its row is not compared.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "SeedTree")]
pub struct DocumentTree {
    sections: Vec<Section>,
    fields: BTreeMap<FieldId, Field>,
    #[serde(skip)]
    claims: BTreeMap<FieldId, Claim>,
}

/// Wire shape of a starting document.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeedTree {
    sections: Vec<Section>,
    #[serde(default)]
    fields: BTreeMap<FieldId, Field>,
}

impl PartialEq for DocumentTree {
    fn eq(&self, other: &Self) -> bool {
        self.sections == other.sections && self.fields == other.fields
    }
}

impl Eq for DocumentTree {}

impl From<SeedTree> for DocumentTree {
    fn from(seed: SeedTree) -> Self {
        let mut sections = seed.sections;
        let mut claims = BTreeMap::new();
        for section in &mut sections {
            section.anchor_rows();
            for row in &section.rows {
                for field_id in &row.fields {
                    claims.insert(
                        field_id.clone(),
                        Claim {
                            row: row.id.clone(),
                            stamp: None,
                        },
                    );
                }
            }
        }
        Self {
            sections,
            fields: seed.fields,
            claims,
        }
    }
}

impl DocumentTree {
    /// A document with exactly one empty section.
    pub fn new(section_id: SectionId, title: impl Into<String>) -> Self {
        Self {
            sections: vec![Section::new(section_id, title)],
            fields: BTreeMap::new(),
            claims: BTreeMap::new(),
        }
    }

    /// Append another (empty) section. Intended for building the shared
    /// starting document before a session begins; sections are not edited
    /// by operations.
    pub fn with_section(mut self, section_id: SectionId, title: impl Into<String>) -> Self {
        if self.section(&section_id).is_none() {
            self.sections.push(Section::new(section_id, title));
        }
        self
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section(&self, section_id: &SectionId) -> Option<&Section> {
        self.sections.iter().find(|section| &section.id == section_id)
    }

    pub fn field(&self, field_id: &FieldId) -> Option<&Field> {
        self.fields.get(field_id)
    }

    pub fn contains_field(&self, field_id: &FieldId) -> bool {
        self.fields.contains_key(field_id)
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// All fields in reading order.
    pub fn fields_in_order(&self) -> Vec<&Field> {
        self.sections
            .iter()
            .flat_map(|section| section.field_ids())
            .filter_map(|id| self.fields.get(id))
            .collect()
    }

    /// Current placement of a field, with row and index filled in.
    pub fn locate(&self, field_id: &FieldId) -> Option<Placement> {
        for section in &self.sections {
            for row in &section.rows {
                if let Some(index) = row.fields.iter().position(|id| id == field_id) {
                    return Some(Placement::in_row(section.id.clone(), row.id.clone(), index));
                }
            }
        }
        None
    }

    /// Check that `placement` can be honoured by any replica: its section
    /// exists. Row ids are scoped to their section, so any row id is valid.
    pub(crate) fn check_placement(&self, placement: &Placement) -> Result<(), MutationError> {
        if self.section(&placement.section_id).is_none() {
            return Err(MutationError::UnknownSection(placement.section_id.clone()));
        }
        Ok(())
    }

    pub(crate) fn field_mut(&mut self, field_id: &FieldId) -> Option<&mut Field> {
        self.fields.get_mut(field_id)
    }

    /// Remove a field from the arena and its row, without settling the rows.
    pub(crate) fn detach_field(&mut self, field_id: &FieldId) -> Option<(Field, Placement)> {
        let placement = self.locate(field_id)?;
        let field = self.fields.remove(field_id)?;
        self.claims.remove(field_id);
        if let Some(section) = self
            .sections
            .iter_mut()
            .find(|section| section.id == placement.section_id)
        {
            for row in &mut section.rows {
                row.fields.retain(|id| id != field_id);
            }
        }
        Some((field, placement))
    }

    /// Lay every section out again from the claims of its fields. Empty rows
    /// are dropped; sections are never removed.
    pub(crate) fn settle(&mut self) {
        for section in &mut self.sections {
            section.settle(&self.claims);
        }
    }

    /// Insert `field` at `placement`, claiming the row for `origin`.
    ///
    /// A request for a new row claims the row derived from `origin`. The
    /// field goes in at the requested index; capacity and row order are only
    /// enforced by the next [`DocumentTree::settle`].
    pub(crate) fn insert_field(
        &mut self,
        field: Field,
        placement: &Placement,
        origin: &Stamp,
    ) -> Result<(), MutationError> {
        let section = self
            .sections
            .iter_mut()
            .find(|section| section.id == placement.section_id)
            .ok_or_else(|| MutationError::UnknownSection(placement.section_id.clone()))?;

        let field_id = field.id.clone();
        let row_id = placement
            .row_id
            .clone()
            .unwrap_or_else(|| origin.derived_row());

        match section.rows.iter_mut().find(|row| row.id == row_id) {
            Some(row) => {
                let index = placement.index.unwrap_or(row.fields.len()).min(row.fields.len());
                row.fields.insert(index, field_id.clone());
            }
            None => section.rows.push(Row {
                id: row_id.clone(),
                fields: vec![field_id.clone()],
            }),
        }

        self.claims.insert(
            field_id.clone(),
            Claim {
                row: row_id,
                stamp: Some(origin.clone()),
            },
        );
        self.fields.insert(field_id, field);
        Ok(())
    }
}
