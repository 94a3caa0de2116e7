//! S3 XML documents
//!
//! Request bodies are rendered as strings; responses are read with a small
//! event walker over `quick-xml` that collects child text per record element.

use std::collections::HashMap;

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;

use super::{CompletedPart, LifecycleRule, ObjectVersion, Tag};
use crate::error::{Error, Result};

const XML_HEADER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;
const S3_NS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

/// One record element with its direct child texts
pub type Record = HashMap<String, String>;

/// Collect every `record` element as a map of child name to text.
///
/// Only leaf text directly under the record is captured; nested wrappers
/// such as `<Owner>` are flattened to their leaf names.
pub fn collect_records(xml: &str, record: &str) -> Result<Vec<Record>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut records = Vec::new();
    let mut current: Option<Record> = None;
    let mut element = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                element = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                if element == record {
                    current = Some(Record::new());
                }
            }
            Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                if name == record {
                    records.push(Record::new());
                } else if let Some(ref mut fields) = current {
                    fields.entry(name).or_default();
                }
            }
            Ok(Event::Text(e)) => {
                if let Some(ref mut fields) = current {
                    let text = e
                        .unescape()
                        .map_err(|e| Error::MalformedResponse(e.to_string()))?
                        .to_string();
                    fields.insert(element.clone(), text);
                }
            }
            Ok(Event::End(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                if name == record {
                    if let Some(fields) = current.take() {
                        records.push(fields);
                    }
                }
                element.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::MalformedResponse(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(records)
}

/// Text of the first element with the given name anywhere in the document
pub fn find_text(xml: &str, name: &str) -> Result<Option<String>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut inside = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                inside = e.local_name().as_ref() == name.as_bytes();
            }
            Ok(Event::Empty(e)) if e.local_name().as_ref() == name.as_bytes() => {
                return Ok(Some(String::new()));
            }
            Ok(Event::Text(e)) if inside => {
                let text = e
                    .unescape()
                    .map_err(|e| Error::MalformedResponse(e.to_string()))?;
                return Ok(Some(text.to_string()));
            }
            Ok(Event::End(e)) => {
                if inside && e.local_name().as_ref() == name.as_bytes() {
                    return Ok(Some(String::new()));
                }
                inside = false;
            }
            Ok(Event::Eof) => return Ok(None),
            Err(e) => return Err(Error::MalformedResponse(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
}

/// Upload ID from an InitiateMultipartUploadResult
pub fn parse_upload_id(xml: &str) -> Result<String> {
    match find_text(xml, "UploadId")? {
        Some(id) if !id.is_empty() => Ok(id),
        _ => Err(Error::MalformedResponse("missing UploadId in initiate response".into())),
    }
}

/// Bucket names from a ListAllMyBucketsResult
pub fn parse_bucket_names(xml: &str) -> Result<Vec<String>> {
    Ok(collect_records(xml, "Bucket")?
        .into_iter()
        .filter_map(|mut record| record.remove("Name"))
        .collect())
}

/// One page of a ListObjectsV2 response
#[derive(Debug, Default)]
pub struct ObjectListPage {
    pub keys: Vec<String>,
    pub next_continuation_token: Option<String>,
}

pub fn parse_object_list(xml: &str) -> Result<ObjectListPage> {
    let keys = collect_records(xml, "Contents")?
        .into_iter()
        .filter_map(|mut record| record.remove("Key"))
        .collect();

    let truncated = find_text(xml, "IsTruncated")?.as_deref() == Some("true");
    let next_continuation_token = if truncated {
        find_text(xml, "NextContinuationToken")?
    } else {
        None
    };

    Ok(ObjectListPage {
        keys,
        next_continuation_token,
    })
}

/// One page of a ListObjectVersions response
#[derive(Debug, Default)]
pub struct VersionListPage {
    pub versions: Vec<ObjectVersion>,
    pub next_key_marker: Option<String>,
    pub next_version_id_marker: Option<String>,
}

pub fn parse_version_list(xml: &str) -> Result<VersionListPage> {
    let mut versions: Vec<ObjectVersion> = collect_records(xml, "Version")?
        .into_iter()
        .map(|record| version_from_record(record, false))
        .collect();
    versions.extend(
        collect_records(xml, "DeleteMarker")?
            .into_iter()
            .map(|record| version_from_record(record, true)),
    );

    let truncated = find_text(xml, "IsTruncated")?.as_deref() == Some("true");
    let (next_key_marker, next_version_id_marker) = if truncated {
        (
            find_text(xml, "NextKeyMarker")?,
            find_text(xml, "NextVersionIdMarker")?,
        )
    } else {
        (None, None)
    };

    Ok(VersionListPage {
        versions,
        next_key_marker,
        next_version_id_marker,
    })
}

fn version_from_record(mut record: Record, is_delete_marker: bool) -> ObjectVersion {
    ObjectVersion {
        key: record.remove("Key").unwrap_or_default(),
        version_id: record.remove("VersionId").unwrap_or_else(|| "null".to_string()),
        is_latest: record.get("IsLatest").map(|v| v == "true").unwrap_or(false),
        is_delete_marker,
        size: record.get("Size").and_then(|v| v.parse().ok()).unwrap_or(0),
        etag: record.remove("ETag"),
        last_modified: record.remove("LastModified"),
    }
}

/// Code and message of an S3 `<Error>` document
pub fn parse_error(xml: &str) -> (Option<String>, Option<String>) {
    let code = find_text(xml, "Code").ok().flatten();
    let message = find_text(xml, "Message").ok().flatten();
    (code, message)
}

pub fn complete_multipart_upload(parts: &[CompletedPart]) -> String {
    let mut xml = format!("{}\n<CompleteMultipartUpload xmlns=\"{}\">\n", XML_HEADER, S3_NS);
    for part in parts {
        xml.push_str("  <Part>\n");
        xml.push_str(&format!("    <PartNumber>{}</PartNumber>\n", part.part_number));
        xml.push_str(&format!("    <ETag>{}</ETag>\n", escape(&part.etag)));
        xml.push_str("  </Part>\n");
    }
    xml.push_str("</CompleteMultipartUpload>");
    xml
}

pub fn create_bucket_configuration(region: &str) -> String {
    format!(
        "{}\n<CreateBucketConfiguration xmlns=\"{}\">\n  <LocationConstraint>{}</LocationConstraint>\n</CreateBucketConfiguration>",
        XML_HEADER,
        S3_NS,
        escape(region)
    )
}

pub fn versioning_configuration(enabled: bool) -> String {
    format!(
        "{}\n<VersioningConfiguration xmlns=\"{}\">\n  <Status>{}</Status>\n</VersioningConfiguration>",
        XML_HEADER,
        S3_NS,
        if enabled { "Enabled" } else { "Suspended" }
    )
}

pub fn lifecycle_configuration(rule: &LifecycleRule) -> String {
    let mut xml = format!("{}\n<LifecycleConfiguration xmlns=\"{}\">\n", XML_HEADER, S3_NS);
    xml.push_str("  <Rule>\n");
    xml.push_str(&format!("    <ID>{}</ID>\n", escape(&rule.id)));
    xml.push_str("    <Filter>\n");
    xml.push_str(&format!("      <Prefix>{}</Prefix>\n", escape(&rule.prefix)));
    xml.push_str("    </Filter>\n");
    xml.push_str(&format!(
        "    <Status>{}</Status>\n",
        if rule.enabled { "Enabled" } else { "Disabled" }
    ));
    xml.push_str("    <Transition>\n");
    xml.push_str(&format!("      <Days>{}</Days>\n", rule.transition_days));
    xml.push_str(&format!(
        "      <StorageClass>{}</StorageClass>\n",
        rule.storage_class.as_str()
    ));
    xml.push_str("    </Transition>\n");
    xml.push_str("  </Rule>\n");
    xml.push_str("</LifecycleConfiguration>");
    xml
}

pub fn tagging(tags: &[Tag]) -> String {
    let mut xml = format!("{}\n<Tagging xmlns=\"{}\">\n  <TagSet>\n", XML_HEADER, S3_NS);
    for tag in tags {
        xml.push_str("    <Tag>\n");
        xml.push_str(&format!("      <Key>{}</Key>\n", escape(&tag.key)));
        xml.push_str(&format!("      <Value>{}</Value>\n", escape(&tag.value)));
        xml.push_str("    </Tag>\n");
    }
    xml.push_str("  </TagSet>\n</Tagging>");
    xml
}
