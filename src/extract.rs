//! Translation boundary between the provider's cleanseMatch body and our models.
//!
//! Everything that knows the provider's field names lives here, so schema
//! drift is absorbed in one place.

use serde_json::{json, Map, Value};

use crate::errors::AppError;
use crate::models::MatchCandidate;

/// Provider error code meaning "no match found" (sent with HTTP 404).
pub const NO_MATCH_ERROR_CODE: &str = "20505";

/// Turns a provider response body into candidates, highest confidence first.
///
/// A missing `matchCandidates` key is an empty result (the provider omits it
/// on "no match" bodies); anything else that doesn't fit is a parse error.
pub fn candidates_from_body(body: &Value) -> Result<Vec<MatchCandidate>, AppError> {
    let object = body.as_object().ok_or_else(|| {
        AppError::IngestParseError("response body is not a JSON object".to_string())
    })?;

    let raw_candidates = match object.get("matchCandidates") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(_) => {
            return Err(AppError::IngestParseError(
                "matchCandidates is not an array".to_string(),
            ))
        }
    };

    let mut candidates = raw_candidates
        .iter()
        .enumerate()
        .map(|(idx, raw)| candidate_from(raw, idx))
        .collect::<Result<Vec<_>, _>>()?;

    // Stable sort keeps the provider's order for equal confidence
    candidates.sort_by(|a, b| b.confidence_score.total_cmp(&a.confidence_score));
    Ok(candidates)
}

/// True for the provider's 404 "no match found" body.
pub fn is_no_match_body(body: &Value) -> bool {
    body.get("error")
        .and_then(|e| e.get("errorCode"))
        .map(|code| match code {
            Value::String(s) => s == NO_MATCH_ERROR_CODE,
            Value::Number(n) => n.to_string() == NO_MATCH_ERROR_CODE,
            _ => false,
        })
        .unwrap_or(false)
}

fn candidate_from(raw: &Value, idx: usize) -> Result<MatchCandidate, AppError> {
    let org = raw.get("organization").ok_or_else(|| {
        AppError::IngestParseError(format!("candidate {} has no organization", idx))
    })?;

    let duns = match org.get("duns") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::Number(n)) if n.is_u64() => format!("{:09}", n.as_u64().unwrap_or_default()),
        _ => {
            return Err(AppError::IngestParseError(format!(
                "candidate {} has no DUNS",
                idx
            )))
        }
    };

    let primary_name = str_at(org, &["primaryName"]);
    let quality = raw.get("matchQualityInformation");

    let confidence_score = quality
        .and_then(|q| q.get("confidenceCode"))
        .and_then(number_of)
        .unwrap_or(0.0);

    let match_grade = quality
        .and_then(|q| q.get("matchGrade"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Ok(MatchCandidate {
        duns,
        confidence_score,
        matched_name: primary_name.clone(),
        match_grade,
        raw_fields: comprehensive_info(org, quality, primary_name),
    })
}

/// Flattens the fields downstream consumers care about into snake_case keys.
fn comprehensive_info(org: &Value, quality: Option<&Value>, primary_name: String) -> Map<String, Value> {
    let control = org.get("dunsControlStatus");
    let operating = control.and_then(|c| c.get("operatingStatus"));
    let address = org.get("primaryAddress");
    let empty = Value::Null;
    let address = address.unwrap_or(&empty);
    let quality = quality.unwrap_or(&empty);

    let components: Vec<Value> = quality
        .get("matchGradeComponents")
        .and_then(|c| c.as_array())
        .map(|items| {
            items
                .iter()
                .map(|c| {
                    json!({
                        "component_type": str_at(c, &["componentType"]),
                        "component_rating": str_at(c, &["componentRating"]),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let mut info = Map::new();
    info.insert("primary_name".into(), json!(primary_name));
    info.insert("website_address".into(), array_at(org, "websiteAddress"));
    info.insert("trade_style_names".into(), array_at(org, "tradeStyleNames"));
    info.insert("telephone".into(), array_at(org, "telephone"));
    info.insert(
        "operating_status".into(),
        json!({
            "description": operating.map(|o| str_at(o, &["description"])).unwrap_or_default(),
            "dnb_code": operating.and_then(|o| o.get("dnbCode")).cloned().unwrap_or(Value::Null),
        }),
    );
    info.insert(
        "is_mail_undeliverable".into(),
        control
            .and_then(|c| c.get("isMailUndeliverable"))
            .cloned()
            .unwrap_or(Value::Null),
    );
    info.insert(
        "address".into(),
        json!({
            "country": {
                "iso_alpha2_code": str_at(address, &["addressCountry", "isoAlpha2Code"]),
                "name": str_at(address, &["addressCountry", "name"]),
            },
            "region": {
                "name": str_at(address, &["addressRegion", "name"]),
                "abbreviated_name": str_at(address, &["addressRegion", "abbreviatedName"]),
            },
            "postal_code": str_at(address, &["postalCode"]),
            "postal_code_extension": str_at(address, &["postalCodeExtension"]),
            "street": {
                "line1": str_at(address, &["streetAddress", "line1"]),
                "line2": str_at(address, &["streetAddress", "line2"]),
            },
        }),
    );
    info.insert(
        "match_quality".into(),
        json!({
            "confidence_code": quality.get("confidenceCode").cloned().unwrap_or(json!(0)),
            "match_grade": str_at(quality, &["matchGrade"]),
            "match_grade_components_count": quality
                .get("matchGradeComponentsCount")
                .cloned()
                .unwrap_or(json!(0)),
        }),
    );
    info.insert("match_grade_components".into(), Value::Array(components));
    info.insert(
        "match_data_profile".into(),
        json!(str_at(quality, &["matchDataProfile"])),
    );
    info.insert(
        "name_match_score".into(),
        quality.get("nameMatchScore").cloned().unwrap_or(Value::Null),
    );
    info
}

fn str_at(value: &Value, path: &[&str]) -> String {
    path.iter()
        .try_fold(value, |v, key| v.get(*key))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn array_at(value: &Value, key: &str) -> Value {
    match value.get(key) {
        Some(Value::Array(items)) => Value::Array(items.clone()),
        _ => Value::Array(Vec::new()),
    }
}

fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok().filter(|f: &f64| f.is_finite()),
        _ => None,
    }
}
