//! Resolved destinations for a run.
//!
//! A [`SheetLayout`] is built once, before any fetch starts, from the sheet
//! configuration and the row mappings read back from the store. It is then
//! shared read-only by the aggregator for the rest of the run. Rows moved by
//! someone editing the sheet mid-run are not noticed.

use std::collections::HashMap;

use crate::a1::{CellRange, CellRef};
use crate::config::{ReferenceBlockConfig, SheetConfig};
use crate::error::AppError;
use crate::ids::EntityId;

/// Entity -> 1-based row in one sheet.
pub type RowMapping = HashMap<EntityId, u32>;

/// Builds a [`RowMapping`] from the values of a key column.
///
/// `values[i]` sits in row `start_row + i`. Blank cells are skipped; when an
/// id appears twice the first row wins.
pub fn build_row_mapping(sheet: &str, values: &[String], start_row: u32) -> RowMapping {
    let mut rows = RowMapping::new();
    for (offset, raw) in values.iter().enumerate() {
        let id = raw.trim();
        if id.is_empty() {
            continue;
        }
        let row = start_row + offset as u32;
        if let Some(first) = rows.get(id) {
            tracing::warn!(
                sheet,
                entity = id,
                first_row = *first,
                duplicate_row = row,
                "Entity listed twice, keeping first row"
            );
            continue;
        }
        rows.insert(EntityId::from(id), row);
    }
    rows
}

/// Cell address of one value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub sheet: String,
    pub row: u32,
    pub column: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Route {
    sheet: usize,
    column: u32,
}

#[derive(Debug)]
struct ResolvedSheet {
    name: String,
    rows: RowMapping,
}

/// A reference block with its anchor parsed.
#[derive(Debug, Clone)]
pub struct ReferenceBlock {
    pub sheet: String,
    pub entity: EntityId,
    pub anchor: CellRef,
    pub fields: Vec<String>,
    pub missing: Option<String>,
}

/// Where each field of each entity goes.
#[derive(Debug, Default)]
pub struct SheetLayout {
    sheets: Vec<ResolvedSheet>,
    routes: HashMap<String, Vec<Route>>,
    blocks: Vec<ReferenceBlock>,
}

/// Result of routing one field of one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    Cell(Destination),
    /// The sheet has no row for this entity.
    Unmapped { sheet: String },
}

impl SheetLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a destination sheet with its resolved row mapping.
    pub fn add_sheet(&mut self, config: &SheetConfig, rows: RowMapping) -> Result<(), AppError> {
        let index = self.sheets.len();
        for (field, column) in config.field_columns()? {
            self.routes
                .entry(field)
                .or_default()
                .push(Route { sheet: index, column });
        }
        self.sheets.push(ResolvedSheet {
            name: config.name.clone(),
            rows,
        });
        Ok(())
    }

    pub fn add_reference_block(&mut self, config: &ReferenceBlockConfig) -> Result<(), AppError> {
        let anchor: CellRef = config.anchor.parse()?;
        self.blocks.push(ReferenceBlock {
            sheet: config.sheet.clone(),
            entity: config.entity.clone(),
            anchor,
            fields: config.fields.clone(),
            missing: config.missing.clone(),
        });
        Ok(())
    }

    pub fn sheet_names(&self) -> impl Iterator<Item = &str> {
        self.sheets.iter().map(|s| s.name.as_str())
    }

    /// Returns true if some sheet receives `field`.
    pub fn is_routed(&self, field: &str) -> bool {
        self.routes.contains_key(field)
    }

    /// Every destination of `field` for `entity`. Empty when no sheet takes the field.
    pub fn place(&self, entity: &EntityId, field: &str) -> Vec<Placement> {
        let Some(routes) = self.routes.get(field) else {
            return Vec::new();
        };
        routes
            .iter()
            .map(|route| {
                let sheet = &self.sheets[route.sheet];
                match sheet.rows.get(entity) {
                    Some(&row) => Placement::Cell(Destination {
                        sheet: sheet.name.clone(),
                        row,
                        column: route.column,
                    }),
                    None => Placement::Unmapped {
                        sheet: sheet.name.clone(),
                    },
                }
            })
            .collect()
    }

    pub fn reference_blocks_for<'a>(
        &'a self,
        entity: &'a EntityId,
    ) -> impl Iterator<Item = &'a ReferenceBlock> {
        self.blocks.iter().filter(move |b| &b.entity == entity)
    }

    pub fn reference_blocks(&self) -> &[ReferenceBlock] {
        &self.blocks
    }
}

impl ReferenceBlock {
    /// The block's cells as a single-column range.
    pub fn range(&self) -> CellRange {
        CellRange::column_run(self.anchor.column, self.anchor.row, self.fields.len() as u32)
    }
}
