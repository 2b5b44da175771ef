//! Structural integrity check of one stored record.

use std::collections::HashSet;

use serde::Serialize;

use crate::primitives::pager::LockMode;
use crate::types::{ElementId, PropId, RecordAddr, Result};

use super::collection::{ids, logical_next, logical_prev, BigView, Direction, Element, ElementRead};
use super::overflow::OverflowRef;
use super::record::SlotPayload;
use super::store::RecordStore;

const MAX_FINDINGS: usize = 32;

/// Indicates the severity level of a verification finding.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifySeverity {
    /// Non-critical issue that may indicate a problem.
    Warning,
    /// Critical issue indicating corruption.
    Error,
}

/// Represents a single issue discovered during verification.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyFinding {
    /// The severity level of this finding.
    pub severity: VerifySeverity,
    /// Human-readable description of the issue.
    pub message: String,
}

impl VerifyFinding {
    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: VerifySeverity::Error,
            message: message.into(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: VerifySeverity::Warning,
            message: message.into(),
        }
    }
}

/// Statistics collected during verification.
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyCounts {
    /// Forwarding stubs followed to reach the record.
    pub forward_hops: u64,
    /// Property slots in the record.
    pub slots: u64,
    /// Collection elements visited.
    pub elements: u64,
    /// Overflow references checked.
    pub overflow_refs: u64,
    /// Pages owned by big collections.
    pub collection_pages: u64,
}

/// Complete report of a verification run.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyReport {
    /// Address the record was found at.
    pub addr: String,
    /// Whether verification passed without errors.
    pub success: bool,
    /// Issues discovered, capped at a fixed number.
    pub findings: Vec<VerifyFinding>,
    /// Statistics about the structures examined.
    pub counts: VerifyCounts,
}

struct Checker<'a> {
    store: &'a RecordStore,
    findings: Vec<VerifyFinding>,
    counts: VerifyCounts,
}

impl Checker<'_> {
    fn push(&mut self, finding: VerifyFinding) {
        if self.findings.len() < MAX_FINDINGS {
            self.findings.push(finding);
        }
    }

    fn check_ref(&mut self, prop: PropId, r: &OverflowRef) {
        self.counts.overflow_refs += 1;
        match self.store.overflow().read_value(r) {
            Ok(bytes) if bytes.len() as u64 == r.len => {}
            Ok(bytes) => self.push(VerifyFinding::error(format!(
                "property {prop}: overflow chain at page {} holds {} bytes, reference says {}",
                r.start,
                bytes.len(),
                r.len
            ))),
            Err(err) => self.push(VerifyFinding::error(format!(
                "property {prop}: overflow chain at page {} unreadable: {err}",
                r.start
            ))),
        }
    }

    fn check_list<L: ElementRead + ?Sized>(&mut self, prop: PropId, list: &L, elements: &[Element]) {
        let header = list.header();
        let mut seen = HashSet::with_capacity(elements.len());
        for pair in elements.windows(2) {
            if pair[0].id >= pair[1].id {
                self.push(VerifyFinding::error(format!(
                    "property {prop}: elements {} and {} out of key order",
                    pair[0].id, pair[1].id
                )));
            }
        }
        for element in elements {
            self.counts.elements += 1;
            if element.id.is_nil() || !seen.insert(element.id) {
                self.push(VerifyFinding::error(format!(
                    "property {prop}: element id {} is nil or repeated",
                    element.id
                )));
            }
            if element.id.0 >= header.next_id {
                self.push(VerifyFinding::error(format!(
                    "property {prop}: element id {} not below generator {}",
                    element.id, header.next_id
                )));
            }
            if let Some(r) = element.value.overflow() {
                let r = *r;
                self.check_ref(prop, &r);
            }
            self.check_links(prop, list, element);
        }
        if elements.len() != header.count as usize {
            self.push(VerifyFinding::error(format!(
                "property {prop}: header counts {} elements, found {}",
                header.count,
                elements.len()
            )));
        }
        let forward = ids(list, Direction::Forward);
        let backward = ids(list, Direction::Backward);
        match (forward, backward) {
            (Ok(forward), Ok(mut backward)) => {
                backward.reverse();
                if forward != backward {
                    self.push(VerifyFinding::error(format!(
                        "property {prop}: backward traversal is not the reverse of forward"
                    )));
                }
                let visited: HashSet<ElementId> = forward.iter().copied().collect();
                if visited.len() != forward.len() || forward.len() != elements.len() {
                    self.push(VerifyFinding::error(format!(
                        "property {prop}: traversal visits {} of {} elements",
                        visited.len(),
                        elements.len()
                    )));
                }
            }
            (Err(err), _) | (_, Err(err)) => {
                self.push(VerifyFinding::error(format!("property {prop}: traversal failed: {err}")))
            }
        }
    }

    fn check_links<L: ElementRead + ?Sized>(&mut self, prop: PropId, list: &L, element: &Element) {
        let next = match logical_next(list, element) {
            Ok(next) => next,
            Err(err) => {
                self.push(VerifyFinding::error(format!("property {prop}: element {}: {err}", element.id)));
                return;
            }
        };
        if next.is_nil() {
            if list.header().last != element.id {
                self.push(VerifyFinding::error(format!(
                    "property {prop}: element {} ends the chain but is not last",
                    element.id
                )));
            }
            return;
        }
        let back = list
            .get(next)
            .and_then(|n| n.map(|n| logical_prev(list, &n)).transpose());
        match back {
            Ok(Some(prev)) if prev == element.id => {}
            Ok(Some(prev)) => self.push(VerifyFinding::error(format!(
                "property {prop}: {} -> {next} but {next} <- {prev}",
                element.id
            ))),
            Ok(None) => self.push(VerifyFinding::error(format!(
                "property {prop}: element {} links to missing {next}",
                element.id
            ))),
            Err(err) => self.push(VerifyFinding::error(format!("property {prop}: element {next}: {err}"))),
        }
    }
}

/// Checks one record: slot ordering, element uniqueness, link symmetry, and
/// overflow reachability.
pub fn verify_record(store: &RecordStore, addr: RecordAddr) -> Result<VerifyReport> {
    let ctx = store.context();
    let located = ctx.locate(addr, LockMode::Shared)?;
    let mut checker = Checker {
        store,
        findings: Vec::new(),
        counts: VerifyCounts {
            forward_hops: located.stubs.len() as u64,
            ..VerifyCounts::default()
        },
    };
    if located.stubs.len() > 1 {
        checker.push(VerifyFinding::warning(format!(
            "record reached through {} forwarding stubs",
            located.stubs.len()
        )));
    }
    let record = &located.record;
    checker.counts.slots = record.slots().len() as u64;
    for pair in record.slots().windows(2) {
        if pair[0].prop >= pair[1].prop {
            checker.push(VerifyFinding::error(format!(
                "slots {} and {} out of order",
                pair[0].prop, pair[1].prop
            )));
        }
    }
    let mut refreshed = record.clone();
    refreshed.refresh_flags();
    if refreshed.flags != record.flags {
        checker.push(VerifyFinding::error(format!(
            "record flags {:#04x} disagree with slots ({:#04x})",
            record.flags, refreshed.flags
        )));
    }
    for slot in record.slots() {
        match &slot.payload {
            SlotPayload::Inline(_) => {}
            SlotPayload::Overflow(r) => checker.check_ref(slot.prop, r),
            SlotPayload::Small(list) => checker.check_list(slot.prop, list, list.elements()),
            SlotPayload::Big(desc) => {
                let view = BigView::new(&*ctx.store, desc);
                match (view.elements(), view.pages()) {
                    (Ok(elements), Ok(pages)) => {
                        checker.counts.collection_pages += pages.len() as u64;
                        checker.check_list(slot.prop, &view, &elements);
                    }
                    (Err(err), _) | (_, Err(err)) => checker.push(VerifyFinding::error(format!(
                        "property {}: big collection unreadable: {err}",
                        slot.prop
                    ))),
                }
            }
        }
    }
    let success = checker
        .findings
        .iter()
        .all(|f| f.severity != VerifySeverity::Error);
    Ok(VerifyReport {
        addr: located.addr.to_string(),
        success,
        findings: checker.findings,
        counts: checker.counts,
    })
}
