//! A1 notation helpers.
//!
//! Spreadsheet backends address cells as `<letters><row>` (`D8`) and ranges as
//! `<start>:<end>` (`H27:H91`). Columns and rows are 1-based throughout.

use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

/// Converts column letters to a 1-based index (`A` = 1, `Z` = 26, `AA` = 27).
pub fn column_index(letters: &str) -> Result<u32, AppError> {
    if letters.is_empty() {
        return Err(AppError::InvalidRange("empty column reference".to_string()));
    }

    let mut index: u32 = 0;
    for c in letters.chars() {
        if !c.is_ascii_alphabetic() {
            return Err(AppError::InvalidRange(format!(
                "invalid column letters '{}'",
                letters
            )));
        }
        let digit = (c.to_ascii_uppercase() as u32) - ('A' as u32) + 1;
        index = index
            .checked_mul(26)
            .and_then(|i| i.checked_add(digit))
            .ok_or_else(|| AppError::InvalidRange(format!("column '{}' too wide", letters)))?;
    }
    Ok(index)
}

/// Converts a 1-based column index back to letters.
///
/// Index 0 has no column and renders as an empty string.
pub fn column_letters(mut index: u32) -> String {
    let mut letters = Vec::new();
    while index > 0 {
        let rem = ((index - 1) % 26) as u8;
        letters.push((b'A' + rem) as char);
        index = (index - 1) / 26;
    }
    letters.iter().rev().collect()
}

/// A single cell reference such as `D8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellRef {
    pub column: u32,
    pub row: u32,
}

impl CellRef {
    pub fn new(column: u32, row: u32) -> Self {
        Self { column, row }
    }
}

impl FromStr for CellRef {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| c.is_ascii_digit())
            .ok_or_else(|| AppError::InvalidRange(format!("missing row in '{}'", s)))?;
        let (letters, digits) = s.split_at(split);
        let column = column_index(letters)?;
        let row: u32 = digits
            .parse()
            .map_err(|_| AppError::InvalidRange(format!("invalid row in '{}'", s)))?;
        if row == 0 {
            return Err(AppError::InvalidRange(format!("row 0 in '{}'", s)));
        }
        Ok(Self { column, row })
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", column_letters(self.column), self.row)
    }
}

/// A rectangular range such as `E11:G200`.
///
/// Parsing normalizes the corners so that `start` is top-left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRange {
    pub start: CellRef,
    pub end: CellRef,
}

impl CellRange {
    /// A vertical run in one column covering `len` rows from `start_row`.
    pub fn column_run(column: u32, start_row: u32, len: u32) -> Self {
        let end_row = start_row + len.saturating_sub(1);
        Self {
            start: CellRef::new(column, start_row),
            end: CellRef::new(column, end_row),
        }
    }

    pub fn is_single_column(&self) -> bool {
        self.start.column == self.end.column
    }

    /// Number of rows spanned, inclusive.
    pub fn height(&self) -> u32 {
        self.end.row - self.start.row + 1
    }

    /// Iterates the row numbers covered by this range.
    pub fn rows(&self) -> impl Iterator<Item = u32> + use<> {
        self.start.row..=self.end.row
    }
}

impl FromStr for CellRange {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (a, b) = match s.split_once(':') {
            Some((a, b)) => (a.parse::<CellRef>()?, b.parse::<CellRef>()?),
            None => {
                let cell = s.parse::<CellRef>()?;
                (cell, cell)
            }
        };
        Ok(Self {
            start: CellRef::new(a.column.min(b.column), a.row.min(b.row)),
            end: CellRef::new(a.column.max(b.column), a.row.max(b.row)),
        })
    }
}

impl fmt::Display for CellRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}:{}", self.start, self.end)
        }
    }
}
