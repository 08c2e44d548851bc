use std::fs;
use std::path::Path;

use assert_matches::assert_matches;
use serde_json::json;

use spikeforest_pipeline::domain::{ContentAddress, SorterName};
use spikeforest_pipeline::error::SfError;
use spikeforest_pipeline::output::{OutputRecord, emit_records, parse_records};

fn sample_record(errored: bool) -> OutputRecord {
    OutputRecord {
        recording_name: "419_1_7".to_string(),
        study_name: "paired_boyden32c".to_string(),
        sorter_name: SorterName::Tridesclous,
        sorting_parameters: json!({"detect_threshold": 5}),
        console_out_uri: ContentAddress::sha1("aec68278bde6695224890000f1db8bd449964c65", Some("file.json")),
        cpu_time_sec: 41.75,
        errored,
        start_time: "2020-02-25T17:07:47.394880".to_string(),
        end_time: "2020-02-25T17:08:29.144880".to_string(),
        sorting_output: (!errored).then(|| {
            ContentAddress::sha1("05536d7a37efb3f5f2ca42c987964f199305f480", Some("file.json"))
        }),
        recording_uri: "sha1://8f8a4e5a0f41b3b8e3f0c3d0f1a2b3c4d5e6f708/419_1_7.json"
            .parse()
            .unwrap(),
        ground_truth_uri: "sha1://1b2c3d4e5f60718293a4b5c6d7e8f90112233445/firings_true.json"
            .parse()
            .unwrap(),
    }
}

#[test]
fn records_serialize_with_camel_case_keys() {
    let value = serde_json::to_value(sample_record(true)).unwrap();
    let keys: Vec<&str> = value.as_object().unwrap().keys().map(String::as_str).collect();
    for key in [
        "recordingName",
        "studyName",
        "sorterName",
        "sortingParameters",
        "consoleOutUri",
        "cpuTimeSec",
        "errored",
        "startTime",
        "endTime",
        "sortingOutput",
        "recordingUri",
        "groundTruthUri",
    ] {
        assert!(keys.contains(&key), "missing {key}");
    }
    assert_eq!(value["sortingOutput"], serde_json::Value::Null);
    assert_eq!(value["sorterName"], json!("Tridesclous"));
    assert_eq!(
        value["consoleOutUri"],
        json!("sha1://aec68278bde6695224890000f1db8bd449964c65/file.json")
    );
}

#[test]
fn emit_writes_a_new_file() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("sortings.json");
    let records = vec![sample_record(false), sample_record(true)];

    emit_records(&records, Some(path.as_path())).unwrap();

    let written: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(parse_records(written).unwrap(), records);
}

#[test]
fn emit_refuses_to_overwrite() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("sortings.json");
    fs::write(&path, "precious").unwrap();

    let err = emit_records(&[sample_record(false)], Some(path.as_path())).unwrap_err();
    assert_matches!(&err, SfError::OutputExists(p) if p == &path);
    assert!(err.is_configuration());
    assert_eq!(fs::read_to_string(&path).unwrap(), "precious");
}

#[cfg(unix)]
#[test]
fn dev_null_is_always_accepted() {
    emit_records(&[sample_record(false)], Some(Path::new("/dev/null"))).unwrap();
}

#[test]
fn wrapped_records_are_accepted() {
    let records = vec![sample_record(false)];
    let wrapped = json!({ "sortingOutputs": serde_json::to_value(&records).unwrap() });
    assert_eq!(parse_records(wrapped).unwrap(), records);
}

#[test]
fn inconsistent_records_are_rejected() {
    let mut value = serde_json::to_value(vec![sample_record(false)]).unwrap();
    value[0]["errored"] = json!(true);
    assert_matches!(parse_records(value), Err(SfError::InconsistentRecord(_)));
}
