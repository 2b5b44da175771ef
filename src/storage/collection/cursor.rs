use crate::types::{ElementId, Result, StoreError};

use super::{logical_next, logical_prev, Element, ElementRead};

/// Traversal direction of a [`Cursor`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    /// From the logical first element.
    Forward,
    /// From the logical last element.
    Backward,
}

/// Iterator over a collection in logical order.
///
/// A cursor visits at most `count` elements; a chain longer than that is a
/// cycle and yields [`StoreError::Corrupted`].
pub struct Cursor<'a, L: ElementRead + ?Sized> {
    list: &'a L,
    direction: Direction,
    next: ElementId,
    remaining: u32,
    done: bool,
}

impl<'a, L: ElementRead + ?Sized> Cursor<'a, L> {
    /// Positions a cursor at the first element in `direction`.
    pub fn new(list: &'a L, direction: Direction) -> Self {
        let header = list.header();
        let next = match direction {
            Direction::Forward => header.first,
            Direction::Backward => header.last,
        };
        Self {
            list,
            direction,
            next,
            remaining: header.count,
            done: false,
        }
    }

    fn step(&mut self) -> Result<Option<Element>> {
        if self.next.is_nil() {
            return Ok(None);
        }
        if self.remaining == 0 {
            return Err(StoreError::Corrupted("collection link cycle"));
        }
        let element = self
            .list
            .get(self.next)?
            .ok_or(StoreError::Corrupted("collection link dangles"))?;
        self.remaining -= 1;
        self.next = match self.direction {
            Direction::Forward => logical_next(self.list, &element)?,
            Direction::Backward => logical_prev(self.list, &element)?,
        };
        Ok(Some(element))
    }
}

impl<L: ElementRead + ?Sized> Iterator for Cursor<'_, L> {
    type Item = Result<Element>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(element)) => Some(Ok(element)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
