//! OAI-PMH protocol behaviour over a populated repository.

use pod_harvest::{
    OaiConfig, OaiEngine, RecordInput, Repository, RepositoryConfig, ResumptionToken, StreamId,
    Timestamp, UploadInput,
};
use std::sync::Arc;
use tempfile::TempDir;

/// 2021-03-01T00:00:00Z in seconds.
const MARCH_FIRST: i64 = 1_614_556_800;

fn day(day: i64, hour: i64) -> Timestamp {
    Timestamp((MARCH_FIRST + (day - 1) * 86_400 + hour * 3_600) * 1_000_000)
}

fn marc(key: &str) -> RecordInput {
    RecordInput::new(
        key,
        format!("<record><controlfield tag=\"001\">{key}</controlfield></record>"),
    )
}

fn records(keys: &[&str]) -> UploadInput {
    UploadInput::records(keys.iter().map(|k| marc(k)))
}

fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn list_records() -> Vec<(String, String)> {
    params(&[("verb", "ListRecords"), ("metadataPrefix", "marc21")])
}

fn token_in(body: &str) -> Option<String> {
    let start = body.find("<resumptionToken>")? + "<resumptionToken>".len();
    let end = body[start..].find("</resumptionToken>")?;
    Some(body[start..start + end].to_string())
}

fn error_code(body: &str) -> Option<&str> {
    let start = body.find("<error code=\"")? + "<error code=\"".len();
    let end = body[start..].find('"')?;
    Some(&body[start..start + end])
}

struct Fixture {
    _dir: TempDir,
    repo: Arc<Repository>,
    engine: OaiEngine,
    main: StreamId,
    other_org: StreamId,
    secondary: StreamId,
}

/// Harvestable OAI pages, in listing order:
/// main full (2 pages, day 1), main delta (day 2), other-org full (day 2),
/// main delta with a deletion (day 3). The secondary stream was never a
/// default and only shows up when asked for by set.
fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let repo = Arc::new(
        Repository::create(RepositoryConfig {
            path: dir.path().join("repo"),
            max_records_per_page: 3,
            ..Default::default()
        })
        .unwrap(),
    );

    let main = repo.create_stream_at("best-org", "", day(1, 0)).unwrap().id;
    let other_org = repo.create_stream_at("other-org", "", day(2, 0)).unwrap().id;
    let secondary = repo
        .create_stream_at("best-org", "spring", day(2, 0))
        .unwrap()
        .id;

    repo.ingest_at(main, records(&["m1", "m2", "m3", "m4"]), day(1, 1))
        .unwrap();
    repo.generate_full_dump_at(main, day(1, 10)).unwrap();

    repo.ingest_at(main, records(&["m5", "m6"]), day(2, 1)).unwrap();
    repo.compute_delta_at(main, day(2, 10)).unwrap();

    repo.ingest_at(other_org, records(&["o1"]), day(2, 2)).unwrap();
    repo.generate_full_dump_at(other_org, day(2, 12)).unwrap();

    repo.ingest_at(secondary, records(&["s1"]), day(2, 3)).unwrap();
    repo.generate_full_dump_at(secondary, day(2, 13)).unwrap();

    repo.ingest_at(main, UploadInput::deletes(["m1"]), day(3, 1))
        .unwrap();
    repo.compute_delta_at(main, day(3, 10)).unwrap();

    let engine = OaiEngine::new(Arc::clone(&repo), OaiConfig::default());
    Fixture {
        _dir: dir,
        repo,
        engine,
        main,
        other_org,
        secondary,
    }
}

// --- ListRecords ---

#[test]
fn test_walk_visits_every_page_once() {
    let f = fixture();
    let now = day(4, 0);

    let mut bodies = Vec::new();
    let mut response = f.engine.respond_at(&list_records(), now).unwrap();
    loop {
        assert!(error_code(&response.body).is_none(), "{}", response.body);
        let next = token_in(&response.body);
        bodies.push(response.body);
        match next {
            Some(token) => {
                response = f
                    .engine
                    .respond_at(&params(&[("verb", "ListRecords"), ("resumptionToken", token.as_str())]), now)
                    .unwrap();
            }
            None => break,
        }
    }

    assert_eq!(bodies.len(), 5);

    let main_prefix = format!("oai:pod.example.org:best-org:{}:", f.main);
    let other_prefix = format!("oai:pod.example.org:other-org:{}:", f.other_org);
    let all = bodies.concat();
    for key in ["m1", "m2", "m3", "m4", "m5", "m6"] {
        assert_eq!(
            all.matches(&format!("<identifier>{main_prefix}{key}</identifier>")).count(),
            if key == "m1" { 2 } else { 1 },
            "{key}"
        );
    }
    assert_eq!(all.matches(&format!("{other_prefix}o1<")).count(), 1);
    assert!(!all.contains(":s1<"));
    assert_eq!(all.matches("<header status=\"deleted\">").count(), 1);

    // Listing order follows commit order.
    assert!(bodies[2].contains(&format!("{main_prefix}m5<")));
    assert!(bodies[3].contains(&format!("{other_prefix}o1<")));
    assert!(bodies[4].contains("<header status=\"deleted\">"));
    assert!(bodies[4].contains("<datestamp>2021-03-03</datestamp>"));
}

#[test]
fn test_records_carry_marc_metadata() {
    let f = fixture();
    let response = f.engine.respond(&list_records()).unwrap();

    assert!(response.body.contains(&format!(
        "<setSpec>{}</setSpec></header><metadata><record xmlns=\"http://www.loc.gov/MARC21/slim\">",
        f.main
    )));
    assert!(response.body.contains("<datestamp>2021-03-01</datestamp>"));
}

#[test]
fn test_day_granularity_filters() {
    let f = fixture();
    let now = day(4, 0);

    let filtered = params(&[
        ("verb", "ListRecords"),
        ("metadataPrefix", "marc21"),
        ("from", "2021-03-02"),
        ("until", "2021-03-02"),
    ]);
    let first = f.engine.respond_at(&filtered, now).unwrap();
    assert!(first.body.contains(":m5</identifier>"));
    let token = token_in(&first.body).unwrap();

    let decoded = ResumptionToken::decode(&token).unwrap();
    assert_eq!(decoded.from_date.as_deref(), Some("2021-03-02"));
    assert_eq!(decoded.until_date.as_deref(), Some("2021-03-02"));
    assert_eq!(decoded.page, 1);

    let second = f
        .engine
        .respond_at(&params(&[("verb", "ListRecords"), ("resumptionToken", token.as_str())]), now)
        .unwrap();
    assert!(second.body.contains(":o1</identifier>"));
    assert!(token_in(&second.body).is_none());

    let from_only = params(&[
        ("verb", "ListRecords"),
        ("metadataPrefix", "marc21"),
        ("from", "2021-03-03"),
    ]);
    let response = f.engine.respond_at(&from_only, now).unwrap();
    assert!(response.body.contains("<header status=\"deleted\">"));
    assert!(token_in(&response.body).is_none());
}

#[test]
fn test_explicit_set_reaches_non_default_stream() {
    let f = fixture();
    let set = f.secondary.to_string();

    let response = f
        .engine
        .respond(&params(&[
            ("verb", "ListRecords"),
            ("metadataPrefix", "marc21"),
            ("set", set.as_str()),
        ]))
        .unwrap();
    assert!(response.body.contains(":s1</identifier>"));
    assert!(!response.body.contains(":m1</identifier>"));
    assert!(token_in(&response.body).is_none());
}

#[test]
fn test_token_pages_survive_new_deltas() {
    let f = fixture();
    let now = day(4, 0);
    let token = ResumptionToken::new(None, None, None).next_page().encode();
    let request = params(&[("verb", "ListRecords"), ("resumptionToken", token.as_str())]);

    let before = f.engine.respond_at(&request, now).unwrap();
    f.repo
        .ingest_at(f.main, records(&["m7"]), day(4, 1))
        .unwrap();
    f.repo.compute_delta_at(f.main, day(4, 2)).unwrap();
    let after = f.engine.respond_at(&request, now).unwrap();

    assert_eq!(before.body, after.body);
}

#[test]
fn test_late_commit_for_earlier_window_is_listed_last() {
    let dir = TempDir::new().unwrap();
    let repo = Arc::new(
        Repository::create(RepositoryConfig {
            path: dir.path().join("repo"),
            max_records_per_page: 2,
            ..Default::default()
        })
        .unwrap(),
    );
    let engine = OaiEngine::new(Arc::clone(&repo), OaiConfig::default());
    let ts = |secs: i64| Timestamp(secs * 1_000_000);

    let a = repo.create_stream_at("org-a", "", ts(0)).unwrap().id;
    let b = repo.create_stream_at("org-b", "", ts(0)).unwrap().id;
    repo.ingest_at(a, records(&["a1"]), ts(10)).unwrap();
    repo.generate_full_dump_at(a, ts(100)).unwrap();
    repo.ingest_at(b, records(&["b1"]), ts(10)).unwrap();
    repo.generate_full_dump_at(b, ts(100)).unwrap();
    repo.ingest_at(b, records(&["b2"]), ts(150)).unwrap();
    repo.compute_delta_at(b, ts(200)).unwrap();
    repo.ingest_at(b, records(&["b3"]), ts(250)).unwrap();
    repo.compute_delta_at(b, ts(300)).unwrap();

    let now = ts(400);
    let mut seen = Vec::new();
    let mut response = engine.respond_at(&list_records(), now).unwrap();
    loop {
        assert!(error_code(&response.body).is_none(), "{}", response.body);
        for key in ["a1", "a2", "b1", "b2", "b3"] {
            if response.body.contains(&format!(">{key}</controlfield>")) {
                seen.push(key);
            }
        }
        let Some(token) = token_in(&response.body) else {
            break;
        };

        // Stream a's run for an earlier window commits mid-walk.
        if seen.len() == 3 {
            repo.ingest_at(a, records(&["a2"]), ts(120)).unwrap();
            repo.compute_delta_at(a, ts(150)).unwrap();
        }

        response = engine
            .respond_at(
                &params(&[("verb", "ListRecords"), ("resumptionToken", token.as_str())]),
                now,
            )
            .unwrap();
    }

    assert_eq!(seen, ["a1", "b1", "b2", "b3", "a2"]);
}

#[test]
fn test_blank_arguments_are_unset() {
    let f = fixture();
    let now = day(4, 0);

    let plain = f.engine.respond_at(&list_records(), now).unwrap();
    let blank = f
        .engine
        .respond_at(
            &params(&[
                ("verb", "ListRecords"),
                ("metadataPrefix", "marc21"),
                ("set", ""),
                ("from", ""),
                ("until", " "),
            ]),
            now,
        )
        .unwrap();

    assert!(error_code(&blank.body).is_none(), "{}", blank.body);
    assert_eq!(token_in(&blank.body), token_in(&plain.body));
    assert_eq!(
        blank.body.split("</request>").nth(1),
        plain.body.split("</request>").nth(1)
    );
}

// --- Protocol errors ---

#[test]
fn test_token_with_other_arguments_is_bad_argument() {
    let f = fixture();
    let token = ResumptionToken::new(None, None, None).encode();

    let response = f
        .engine
        .respond(&params(&[
            ("verb", "ListRecords"),
            ("resumptionToken", token.as_str()),
            ("set", "1"),
        ]))
        .unwrap();
    assert_eq!(error_code(&response.body), Some("badArgument"));
    assert!(response.body.contains("<request>http://localhost:3000/oai</request>"));
}

#[test]
fn test_unsupported_prefix() {
    let f = fixture();
    let response = f
        .engine
        .respond(&params(&[("verb", "ListRecords"), ("metadataPrefix", "oai_dc")]))
        .unwrap();
    assert_eq!(error_code(&response.body), Some("cannotDisseminateFormat"));
    assert!(response.body.contains(
        "<request verb=\"ListRecords\" metadataPrefix=\"oai_dc\">http://localhost:3000/oai</request>"
    ));
}

#[test]
fn test_missing_prefix() {
    let f = fixture();
    let response = f
        .engine
        .respond(&params(&[("verb", "ListRecords"), ("set", "1")]))
        .unwrap();
    assert_eq!(error_code(&response.body), Some("badArgument"));
}

#[test]
fn test_no_records_match() {
    let f = fixture();
    for request in [
        params(&[("verb", "ListRecords"), ("metadataPrefix", "marc21"), ("from", "2030-01-01")]),
        params(&[("verb", "ListRecords"), ("metadataPrefix", "marc21"), ("set", "999")]),
        params(&[("verb", "ListRecords"), ("metadataPrefix", "marc21"), ("set", "best-org")]),
        params(&[("verb", "ListRecords"), ("metadataPrefix", "marc21"), ("until", "2021-02-28")]),
    ] {
        let response = f.engine.respond(&request).unwrap();
        assert_eq!(error_code(&response.body), Some("noRecordsMatch"), "{request:?}");
        assert!(response.body.contains("<request verb=\"ListRecords\""));
    }

    let dir = TempDir::new().unwrap();
    let empty = Arc::new(
        Repository::create(RepositoryConfig {
            path: dir.path().join("repo"),
            ..Default::default()
        })
        .unwrap(),
    );
    let engine = OaiEngine::new(empty, OaiConfig::default());
    let response = engine.respond(&list_records()).unwrap();
    assert_eq!(error_code(&response.body), Some("noRecordsMatch"));
}

#[test]
fn test_bad_resumption_tokens() {
    let f = fixture();
    let past_end = ResumptionToken {
        page: 5,
        ..Default::default()
    }
    .encode();
    let bad_date = ResumptionToken::new(None, Some("March".into()), None).encode();

    for token in [past_end.as_str(), bad_date.as_str(), "garbage!"] {
        let response = f
            .engine
            .respond(&params(&[("verb", "ListRecords"), ("resumptionToken", token)]))
            .unwrap();
        assert_eq!(error_code(&response.body), Some("badResumptionToken"), "{token}");
        assert!(response.body.contains("resumptionToken=\""));
    }
}

#[test]
fn test_invalid_dates_are_bad_arguments() {
    let f = fixture();
    for (from, until) in [
        ("yesterday", "2021-03-02"),
        ("2021-03-03", "2021-03-02"),
        ("2021-03-01T00:00:00Z", "2021-03-02"),
    ] {
        let response = f
            .engine
            .respond(&params(&[
                ("verb", "ListRecords"),
                ("metadataPrefix", "marc21"),
                ("from", from),
                ("until", until),
            ]))
            .unwrap();
        assert_eq!(error_code(&response.body), Some("badArgument"), "{from} {until}");
    }
}

#[test]
fn test_bad_verbs_and_arguments_are_not_echoed() {
    let f = fixture();
    let cases = [
        (params(&[]), "badVerb"),
        (params(&[("verb", "GetRecord"), ("identifier", "x")]), "badVerb"),
        (params(&[("verb", "Identify"), ("verb", "Identify")]), "badVerb"),
        (params(&[("verb", "Identify"), ("set", "1")]), "badArgument"),
        (
            params(&[("verb", "ListRecords"), ("metadataPrefix", "marc21"), ("metadataPrefix", "marc21")]),
            "badArgument",
        ),
    ];

    for (request, code) in cases {
        let response = f.engine.respond(&request).unwrap();
        assert_eq!(error_code(&response.body), Some(code), "{request:?}");
        assert!(response.body.contains("<request>http://localhost:3000/oai</request>"));
    }
}

// --- Other verbs ---

#[test]
fn test_list_sets() {
    let f = fixture();
    let response = f.engine.respond(&params(&[("verb", "ListSets")])).unwrap();
    let body = response.body;

    assert!(body.contains(&format!("<setSpec>{}</setSpec>", f.main)));
    assert!(body.contains(&format!("<setSpec>{}</setSpec>", f.other_org)));
    assert!(!body.contains(&format!("<setSpec>{}</setSpec>", f.secondary)));
    assert!(body.contains("<setName>best-org, stream 2021-03-01 - </setName>"));
    assert!(body.contains("<setName>other-org, stream 2021-03-02 - </setName>"));
    assert!(body.contains("<oai_dc:dc xmlns:oai_dc=\"http://www.openarchives.org/OAI/2.0/oai_dc/\""));
    assert!(body.contains(
        "<dc:description>Records from best-org (default stream 2021-03-01 to present)</dc:description>"
    ));

    let with_token = f
        .engine
        .respond(&params(&[("verb", "ListSets"), ("resumptionToken", "abc")]))
        .unwrap();
    assert_eq!(error_code(&with_token.body), Some("badResumptionToken"));
    assert!(with_token
        .body
        .contains("<request verb=\"ListSets\" resumptionToken=\"abc\">"));
}

#[test]
fn test_list_sets_follows_default_history() {
    let f = fixture();
    f.repo.make_default_at(f.secondary, day(5, 0)).unwrap();

    let body = f.engine.respond(&params(&[("verb", "ListSets")])).unwrap().body;
    assert!(body.contains(&format!("<setSpec>{}</setSpec>", f.secondary)));
    assert!(body.contains("<setName>best-org, stream spring</setName>"));
    assert!(body.contains("default stream 2021-03-01 to 2021-03-05"));
}

#[test]
fn test_identify() {
    let f = fixture();
    let body = f.engine.respond(&params(&[("verb", "Identify")])).unwrap().body;

    assert!(body.contains("<repositoryName>POD Aggregator</repositoryName>"));
    assert!(body.contains("<baseURL>http://localhost:3000/oai</baseURL>"));
    assert!(body.contains("<protocolVersion>2.0</protocolVersion>"));
    assert!(body.contains("<earliestDatestamp>2021-03-01</earliestDatestamp>"));
    assert!(body.contains("<granularity>YYYY-MM-DD</granularity>"));
    assert!(body.contains("<adminEmail>admin@example.org</adminEmail>"));
}

#[test]
fn test_list_metadata_formats() {
    let f = fixture();
    let body = f
        .engine
        .respond(&params(&[("verb", "ListMetadataFormats")]))
        .unwrap()
        .body;

    assert_eq!(body.matches("<metadataFormat>").count(), 1);
    assert!(body.contains("<metadataPrefix>marc21</metadataPrefix>"));
    assert!(body.contains(
        "<schema>http://www.loc.gov/standards/marcxml/schema/MARC21slim.xsd</schema>"
    ));
    assert!(body.contains("<metadataNamespace>http://www.loc.gov/MARC21/slim</metadataNamespace>"));
}
