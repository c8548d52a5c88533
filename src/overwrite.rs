//! Overwriting policies.
//!
//! When a restore or merge finds an entry already in place, a policy decides
//! what happens to its data and to its EA. A policy is a tree of boolean
//! criteria over the pair (in place, to be added) and of actions; evaluation
//! always terminates because the tree is finite.
//!
//! Comparative criteria (`DataMoreRecent`, `DataBigger`, `MoreEa`,
//! `EaBigger`, `EaMoreRecent`) ask whether the entry to be added exceeds the
//! one in place; `Invert` swaps the operands. Plain predicates
//! (`DataSaved`, `DataDirty`, `EaPresent`, ...) look at the in-place entry.

use crate::ea::EaStatus;
use crate::entry::{BASE_FILE, Child, Item, SaveStatus};

/// What to do with the data of the in-place entry.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DataAction {
    Preserve,
    Overwrite,
    PreserveMarkAlreadySaved,
    OverwriteMarkAlreadySaved,
    Remove,
    #[default]
    Undefined,
    Ask,
}

/// What to do with the EA of the in-place entry.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum EaAction {
    Preserve,
    Overwrite,
    Clear,
    PreserveMarkAlreadySaved,
    OverwriteMarkAlreadySaved,
    MergePreserve,
    MergeOverwrite,
    #[default]
    Undefined,
    Ask,
}

/// Boolean predicate over an entry pair.
#[derive(Clone, Debug)]
pub enum Criterion {
    InPlaceIsInode,
    InPlaceIsDir,
    InPlaceIsFile,
    InPlaceIsHardlinked,
    /// Hard-linked and no other link of the same inode is held elsewhere.
    InPlaceIsNewHardlinked,
    SameType,
    /// The entry to be added has more recent data than the one in place.
    DataMoreRecent { hourshift: u64 },
    /// The in-place entry's data date is at least `date`.
    DataMoreRecentOrEqualTo { date: i64, hourshift: u64 },
    DataBigger,
    DataSaved,
    DataDirty,
    DataSparse,
    HasDeltaSig,
    EaPresent,
    /// The entry to be added has more recent EA than the one in place.
    EaMoreRecent { hourshift: u64 },
    /// The in-place entry's EA date is at least `date`.
    EaMoreRecentOrEqualTo { date: i64, hourshift: u64 },
    MoreEa,
    EaBigger,
    EaSaved,
    Not(Box<Criterion>),
    And(Vec<Criterion>),
    Or(Vec<Criterion>),
    /// Evaluates the inner criterion with the operands swapped.
    Invert(Box<Criterion>),
}

/// Timestamps are considered equal when they differ by a whole number of
/// hours within the shift, which absorbs timezone changes between backups.
pub(crate) fn equal_with_hourshift(a: i64, b: i64, hourshift: u64) -> bool {
    let delta = a.abs_diff(b);
    delta % 3600 == 0 && delta / 3600 <= hourshift
}

fn more_recent(candidate: i64, reference: i64, hourshift: u64) -> bool {
    !equal_with_hourshift(candidate, reference, hourshift) && candidate > reference
}

/// Data timestamp of an entry, when it has one.
fn data_date(child: &Child) -> Option<i64> {
    match &child.item {
        Item::Inode(inode) => Some(inode.attr.mtime),
        Item::Dir(dir) => Some(dir.attr.mtime),
        Item::Mirage(mirage) => Some(mirage.star.borrow().inode.attr.mtime),
        Item::Detruit(d) => Some(d.ctime),
        _ => None,
    }
}

/// EA timestamp: change time tracks attribute modification.
fn ea_date(child: &Child) -> Option<i64> {
    match &child.item {
        Item::Inode(inode) => Some(inode.attr.ctime),
        Item::Dir(dir) => Some(dir.attr.ctime),
        Item::Mirage(mirage) => Some(mirage.star.borrow().inode.attr.ctime),
        _ => None,
    }
}

fn file_size(child: &Child) -> Option<u64> {
    match &child.item {
        Item::Inode(inode) => inode.as_file().map(|d| d.size),
        Item::Mirage(mirage) => mirage.star.borrow().inode.as_file().map(|d| d.size),
        _ => None,
    }
}

fn with_attr<T>(child: &Child, f: impl FnOnce(&crate::entry::InodeAttr) -> T) -> Option<T> {
    match &child.item {
        Item::Inode(inode) => Some(f(&inode.attr)),
        Item::Dir(dir) => Some(f(&dir.attr)),
        Item::Mirage(mirage) => Some(f(&mirage.star.borrow().inode.attr)),
        _ => None,
    }
}

fn data_status(child: &Child) -> Option<SaveStatus> {
    match &child.item {
        Item::Inode(inode) => Some(inode.status),
        Item::Dir(dir) => Some(dir.status),
        Item::Mirage(mirage) => Some(mirage.star.borrow().inode.status),
        _ => None,
    }
}

impl Criterion {
    pub fn evaluate(&self, in_place: &Child, to_add: &Child) -> bool {
        match self {
            Self::InPlaceIsInode => {
                matches!(in_place.item, Item::Inode(_) | Item::Dir(_) | Item::Mirage(_))
            }
            Self::InPlaceIsDir => in_place.item.is_dir(),
            Self::InPlaceIsFile => in_place.item.base_tag() == BASE_FILE,
            Self::InPlaceIsHardlinked => matches!(in_place.item, Item::Mirage(_)),
            Self::InPlaceIsNewHardlinked => match &in_place.item {
                // the catalogue map holds only weak handles, so the strong
                // count is the number of mirage entries alive
                Item::Mirage(m) => std::rc::Rc::strong_count(&m.star) <= 1,
                _ => false,
            },
            Self::SameType => in_place.item.base_tag() == to_add.item.base_tag(),
            Self::DataMoreRecent { hourshift } => {
                match (data_date(to_add), data_date(in_place)) {
                    (Some(a), Some(b)) => more_recent(a, b, *hourshift),
                    _ => false,
                }
            }
            Self::DataMoreRecentOrEqualTo { date, hourshift } => match data_date(in_place) {
                Some(d) => d >= *date || equal_with_hourshift(d, *date, *hourshift),
                None => false,
            },
            Self::DataBigger => match (file_size(to_add), file_size(in_place)) {
                (Some(a), Some(b)) => a > b,
                _ => false,
            },
            Self::DataSaved => matches!(
                data_status(in_place),
                Some(SaveStatus::Saved | SaveStatus::Delta)
            ),
            Self::DataDirty => match &in_place.item {
                Item::Inode(inode) => inode.as_file().is_some_and(|d| d.dirty),
                Item::Mirage(m) => m.star.borrow().inode.as_file().is_some_and(|d| d.dirty),
                _ => false,
            },
            Self::DataSparse => match &in_place.item {
                Item::Inode(inode) => inode.as_file().is_some_and(|d| d.sparse),
                Item::Mirage(m) => m.star.borrow().inode.as_file().is_some_and(|d| d.sparse),
                _ => false,
            },
            Self::HasDeltaSig => match &in_place.item {
                Item::Inode(inode) => inode.as_file().is_some_and(|d| d.has_delta_sig),
                Item::Mirage(m) => m
                    .star
                    .borrow()
                    .inode
                    .as_file()
                    .is_some_and(|d| d.has_delta_sig),
                _ => false,
            },
            Self::EaPresent => with_attr(in_place, |attr| {
                !matches!(attr.ea_status, EaStatus::None | EaStatus::Removed)
            })
            .unwrap_or(false),
            Self::EaMoreRecent { hourshift } => match (ea_date(to_add), ea_date(in_place)) {
                (Some(a), Some(b)) => more_recent(a, b, *hourshift),
                _ => false,
            },
            Self::EaMoreRecentOrEqualTo { date, hourshift } => match ea_date(in_place) {
                Some(d) => d >= *date || equal_with_hourshift(d, *date, *hourshift),
                None => false,
            },
            Self::MoreEa => {
                let count = |c: &Child| {
                    with_attr(c, |attr| attr.ea.as_ref().map(|ea| ea.len()).unwrap_or(0))
                        .unwrap_or(0)
                };
                count(to_add) > count(in_place)
            }
            Self::EaBigger => {
                let weight =
                    |c: &Child| with_attr(c, |attr| attr.ea_size).unwrap_or(0);
                weight(to_add) > weight(in_place)
            }
            Self::EaSaved => {
                with_attr(in_place, |attr| attr.ea_status == EaStatus::Full).unwrap_or(false)
            }
            Self::Not(inner) => !inner.evaluate(in_place, to_add),
            Self::And(all) => all.iter().all(|c| c.evaluate(in_place, to_add)),
            Self::Or(any) => any.iter().any(|c| c.evaluate(in_place, to_add)),
            Self::Invert(inner) => inner.evaluate(to_add, in_place),
        }
    }
}

/// An overwriting policy: a tree of actions guarded by criteria.
#[derive(Clone, Debug)]
pub enum Policy {
    /// Always the same pair of actions.
    Constant(DataAction, EaAction),
    /// Branches on a criterion.
    Testing {
        cond: Criterion,
        if_true: Box<Policy>,
        if_false: Box<Policy>,
    },
    /// Evaluates members in order until both actions are defined.
    Chain(Vec<Policy>),
}

impl Default for Policy {
    fn default() -> Self {
        Self::Constant(DataAction::Preserve, EaAction::Preserve)
    }
}

impl Policy {
    pub fn evaluate(&self, in_place: &Child, to_add: &Child) -> (DataAction, EaAction) {
        match self {
            Self::Constant(data, ea) => (*data, *ea),
            Self::Testing {
                cond,
                if_true,
                if_false,
            } => {
                if cond.evaluate(in_place, to_add) {
                    if_true.evaluate(in_place, to_add)
                } else {
                    if_false.evaluate(in_place, to_add)
                }
            }
            Self::Chain(members) => {
                let mut data = DataAction::Undefined;
                let mut ea = EaAction::Undefined;
                for member in members {
                    let (d, e) = member.evaluate(in_place, to_add);
                    if data == DataAction::Undefined {
                        data = d;
                    }
                    if ea == EaAction::Undefined {
                        ea = e;
                    }
                    if data != DataAction::Undefined && ea != EaAction::Undefined {
                        break;
                    }
                }
                (data, ea)
            }
        }
    }

    /// A policy leaving an action undefined for some pair is incomplete.
    pub fn is_complete(&self, in_place: &Child, to_add: &Child) -> bool {
        let (data, ea) = self.evaluate(in_place, to_add);
        data != DataAction::Undefined && ea != EaAction::Undefined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::CompressionAlgo;
    use crate::entry::{FileData, Inode, InodeAttr, InodePayload};

    fn file(mtime: i64, size: u64) -> Child {
        Child::new(
            "f",
            Item::Inode(Inode {
                attr: InodeAttr {
                    mtime,
                    ctime: mtime,
                    ..Default::default()
                },
                status: SaveStatus::Saved,
                payload: InodePayload::File(FileData {
                    size,
                    compression: CompressionAlgo::None,
                    ..Default::default()
                }),
            }),
        )
    }

    #[test]
    fn newer_incoming_data_triggers_overwrite() {
        let policy = Policy::Testing {
            cond: Criterion::DataMoreRecent { hourshift: 0 },
            if_true: Box::new(Policy::Constant(DataAction::Overwrite, EaAction::Preserve)),
            if_false: Box::new(Policy::Constant(DataAction::Preserve, EaAction::Preserve)),
        };
        let in_place = file(1000, 10);
        let newer = file(1010, 10);
        assert_eq!(
            policy.evaluate(&in_place, &newer),
            (DataAction::Overwrite, EaAction::Preserve)
        );
        // swap the dates: the incoming entry is older
        assert_eq!(
            policy.evaluate(&newer, &in_place),
            (DataAction::Preserve, EaAction::Preserve)
        );
    }

    #[test]
    fn hourshift_absorbs_timezone_steps() {
        let crit = Criterion::DataMoreRecent { hourshift: 1 };
        let base = file(10_000, 1);
        let one_hour_later = file(10_000 + 3600, 1);
        let just_later = file(10_001, 1);
        assert!(!crit.evaluate(&base, &one_hour_later));
        assert!(crit.evaluate(&base, &just_later));
    }

    #[test]
    fn chain_takes_first_defined_actions() {
        let chain = Policy::Chain(vec![
            Policy::Testing {
                cond: Criterion::DataBigger,
                if_true: Box::new(Policy::Constant(DataAction::Overwrite, EaAction::Undefined)),
                if_false: Box::new(Policy::Constant(
                    DataAction::Undefined,
                    EaAction::Undefined,
                )),
            },
            Policy::Constant(DataAction::Preserve, EaAction::MergePreserve),
        ]);
        let small = file(0, 5);
        let big = file(0, 50);
        assert_eq!(
            chain.evaluate(&small, &big),
            (DataAction::Overwrite, EaAction::MergePreserve)
        );
        assert_eq!(
            chain.evaluate(&big, &small),
            (DataAction::Preserve, EaAction::MergePreserve)
        );
    }

    #[test]
    fn incomplete_chain_is_reported() {
        let chain = Policy::Chain(vec![Policy::Constant(
            DataAction::Overwrite,
            EaAction::Undefined,
        )]);
        let a = file(0, 1);
        let b = file(0, 2);
        assert!(!chain.is_complete(&a, &b));
        assert!(Policy::default().is_complete(&a, &b));
    }

    #[test]
    fn invert_swaps_operands() {
        let crit = Criterion::Invert(Box::new(Criterion::DataBigger));
        let small = file(0, 5);
        let big = file(0, 50);
        // DataBigger asks whether to-add is bigger; inverted, it asks
        // whether in-place is bigger
        assert!(crit.evaluate(&big, &small));
        assert!(!crit.evaluate(&small, &big));
    }

    #[test]
    fn structural_criteria() {
        let f = file(0, 1);
        let d = Child::new(
            "d",
            Item::Dir(crate::entry::Directory::new(
                InodeAttr::default(),
                SaveStatus::Saved,
            )),
        );
        assert!(Criterion::InPlaceIsInode.evaluate(&f, &d));
        assert!(Criterion::InPlaceIsFile.evaluate(&f, &d));
        assert!(!Criterion::InPlaceIsDir.evaluate(&f, &d));
        assert!(Criterion::InPlaceIsDir.evaluate(&d, &f));
        assert!(!Criterion::SameType.evaluate(&f, &d));
        assert!(Criterion::SameType.evaluate(&f, &file(99, 4)));
        assert!(
            Criterion::Not(Box::new(Criterion::InPlaceIsDir)).evaluate(&f, &d)
        );
    }
}
