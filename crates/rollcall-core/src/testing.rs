//! In-memory sheet store shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::a1::CellRange;
use crate::error::{AppError, StoreErrorDetails};
use crate::traits::SheetStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Read(String, String),
    Insert(String, u32),
    Cell(String, String),
    Range(String, String),
    Clear(String, String),
}

/// Cells keyed by `(sheet, column, row)`.
#[derive(Clone, Default)]
pub struct MemoryStore {
    pub cells: Arc<Mutex<HashMap<(String, u32, u32), String>>>,
    pub calls: Arc<Mutex<Vec<Call>>>,
    /// Number of upcoming calls that answer 429.
    pub throttled: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn with_column(sheet: &str, column: u32, start_row: u32, values: &[&str]) -> Self {
        let store = Self::default();
        store.seed(sheet, column, start_row, values);
        store
    }

    pub fn seed(&self, sheet: &str, column: u32, start_row: u32, values: &[&str]) {
        let mut cells = self.cells.lock().unwrap();
        for (i, v) in values.iter().enumerate() {
            cells.insert((sheet.to_string(), column, start_row + i as u32), v.to_string());
        }
    }

    pub fn throttle(&self, n: usize) {
        self.throttled.store(n, Ordering::SeqCst);
    }

    pub fn get(&self, sheet: &str, column: u32, row: u32) -> Option<String> {
        self.cells
            .lock()
            .unwrap()
            .get(&(sheet.to_string(), column, row))
            .cloned()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn enter(&self, call: Call) -> Result<(), AppError> {
        self.calls.lock().unwrap().push(call);
        let throttled = self
            .throttled
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if throttled {
            return Err(AppError::StoreError(StoreErrorDetails::rate_limited(
                "Quota exceeded",
            )));
        }
        Ok(())
    }
}

impl SheetStore for MemoryStore {
    async fn read_column_range(&self, sheet: &str, range: &str) -> Result<Vec<String>, AppError> {
        self.enter(Call::Read(sheet.to_string(), range.to_string()))?;
        let range: CellRange = range.parse()?;
        let cells = self.cells.lock().unwrap();
        let mut values: Vec<String> = range
            .rows()
            .map(|row| {
                cells
                    .get(&(sheet.to_string(), range.start.column, row))
                    .cloned()
                    .unwrap_or_default()
            })
            .collect();
        while values.last().is_some_and(|v| v.is_empty()) {
            values.pop();
        }
        Ok(values)
    }

    async fn insert_column(&self, sheet: &str, column: u32) -> Result<(), AppError> {
        self.enter(Call::Insert(sheet.to_string(), column))?;
        let mut cells = self.cells.lock().unwrap();
        let shifted: HashMap<_, _> = cells
            .drain()
            .map(|((s, c, r), v)| {
                if s == sheet && c >= column {
                    ((s, c + 1, r), v)
                } else {
                    ((s, c, r), v)
                }
            })
            .collect();
        *cells = shifted;
        Ok(())
    }

    async fn write_cell(&self, sheet: &str, cell: &str, value: &str) -> Result<(), AppError> {
        self.enter(Call::Cell(sheet.to_string(), cell.to_string()))?;
        let range: CellRange = cell.parse()?;
        self.cells.lock().unwrap().insert(
            (sheet.to_string(), range.start.column, range.start.row),
            value.to_string(),
        );
        Ok(())
    }

    async fn write_range(&self, sheet: &str, range: &str, values: &[String]) -> Result<(), AppError> {
        self.enter(Call::Range(sheet.to_string(), range.to_string()))?;
        let range: CellRange = range.parse()?;
        let mut cells = self.cells.lock().unwrap();
        for (row, value) in range.rows().zip(values) {
            cells.insert((sheet.to_string(), range.start.column, row), value.clone());
        }
        Ok(())
    }

    async fn clear_range(&self, sheet: &str, range: &str) -> Result<(), AppError> {
        self.enter(Call::Clear(sheet.to_string(), range.to_string()))?;
        let range: CellRange = range.parse()?;
        self.cells.lock().unwrap().retain(|(s, c, r), _| {
            !(s == sheet
                && (range.start.column..=range.end.column).contains(c)
                && (range.start.row..=range.end.row).contains(r))
        });
        Ok(())
    }
}
