//! Query Planner: date window to an ordered UID universe.
//!
//! IMAP date search is day-granular and evaluated in the server's notion of
//! a calendar day. `SINCE start BEFORE end+1` covers both endpoint days as
//! the server sees them; the result is used as-is with no client-side
//! filtering, so it may include messages near the boundaries that a
//! caller-local reading of the dates would exclude.

use chrono::NaiveDate;
use log::info;

use crate::domain::email::Uid;
use crate::error::Result;
use crate::mail::imap_client::Connector;
use crate::mail::session::MailSession;

const IMAP_DATE_FORMAT: &str = "%d-%b-%Y";

/// Search criterion for the inclusive window `[start, end]`.
pub fn date_criterion(start: NaiveDate, end: NaiveDate) -> String {
    let since = start.format(IMAP_DATE_FORMAT);
    match end.succ_opt() {
        Some(next) => format!("SINCE {since} BEFORE {}", next.format(IMAP_DATE_FORMAT)),
        None => format!("SINCE {since}"),
    }
}

/// Ascending, de-duplicated UIDs: this is the export row order.
pub fn order_uids(mut uids: Vec<Uid>) -> Vec<Uid> {
    uids.sort_unstable();
    uids.dedup();
    uids
}

/// Selects `folder` and returns the UIDs matching the window, oldest first.
pub fn plan<C: Connector>(
    session: &mut MailSession<'_, C>,
    folder: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<Uid>> {
    session.select(folder)?;
    let criterion = date_criterion(start, end);
    let uids = order_uids(session.search(&criterion)?);
    info!("{} messages in {folder} match {criterion}", uids.len());
    Ok(uids)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn criterion_is_inclusive_of_end_day() {
        assert_eq!(
            date_criterion(d(2024, 1, 1), d(2024, 1, 31)),
            "SINCE 01-Jan-2024 BEFORE 01-Feb-2024"
        );
        assert_eq!(
            date_criterion(d(2024, 2, 29), d(2024, 2, 29)),
            "SINCE 29-Feb-2024 BEFORE 01-Mar-2024"
        );
    }

    #[test]
    fn criterion_at_year_boundary() {
        assert_eq!(
            date_criterion(d(2023, 12, 25), d(2023, 12, 31)),
            "SINCE 25-Dec-2023 BEFORE 01-Jan-2024"
        );
    }

    #[test]
    fn open_ended_at_max_date() {
        assert_eq!(
            date_criterion(d(2024, 1, 1), NaiveDate::MAX),
            "SINCE 01-Jan-2024"
        );
    }

    #[test]
    fn uids_sorted_ascending() {
        assert_eq!(order_uids(vec![42, 7, 19, 7]), vec![7, 19, 42]);
    }
}
