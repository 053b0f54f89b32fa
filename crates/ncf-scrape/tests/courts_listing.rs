//! Fixture test against a captured court listing page.

use ncf_core::Table;
use ncf_scrape::{page_urls, parse_listing};

const LISTING: &str = include_str!("fixtures/listing.html");

#[test]
fn listing_fixture_parses_every_filing_with_snake_case_keys() {
    let records = parse_listing(LISTING).unwrap();
    assert_eq!(records.len(), 2);

    let first = &records[0];
    assert_eq!(first.get("defendant_name").map(String::as_str), Some("DOE, JOHN"));
    assert_eq!(
        first.get("docket_number").map(String::as_str),
        Some("MC-51-CR-0001234-2021")
    );
    assert_eq!(first.get("filing_date").map(String::as_str), Some("06/01/2021"));
    assert_eq!(first.get("bail_amount").map(String::as_str), Some("$5,000.00"));
    // Values stay raw at this boundary; the "None" marker is normalized
    // away when the batch becomes a table.
    assert_eq!(first.get("represented").map(String::as_str), Some("None"));
    // Address lines split by <br>: the label pairs with the first line.
    assert_eq!(first.get("address").map(String::as_str), Some("1200 MARKET ST"));

    let second = &records[1];
    assert_eq!(
        second.get("docket_number").map(String::as_str),
        Some("CP-51-CR-0005678-2021")
    );
    assert_eq!(second.get("bail_status").map(String::as_str), Some("None"));
}

#[test]
fn listing_fixture_records_build_a_null_normalized_table() {
    let records = parse_listing(LISTING).unwrap();
    let table = Table::from_records(&records);
    assert_eq!(table.len(), 2);
    assert_eq!(table.cell(0, "represented"), None);
    assert_eq!(table.cell(1, "bail_amount"), None);
    assert_eq!(table.cell(1, "represented"), Some("Public Defender"));
}

#[test]
fn listing_fixture_pagination_discovers_both_pages_once() {
    let urls = page_urls("https://courts.example.gov", "unused", LISTING).unwrap();
    assert_eq!(
        urls,
        vec![
            "https://courts.example.gov/NewCriminalFilings/date/default.aspx?search=2021-06-01&page=1".to_string(),
            "https://courts.example.gov/NewCriminalFilings/date/default.aspx?search=2021-06-01&page=2".to_string(),
        ]
    );
}
