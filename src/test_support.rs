use wiremock::{Request, Respond, ResponseTemplate};

/// Deterministic filler so byte-identity assertions catch misplaced writes.
pub(crate) fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) % 251) as u8).collect()
}

/// Mock origin that honors `Range: bytes=a-b` with a 206 slice of its body
/// and falls back to a plain 200 with the whole body otherwise.
pub(crate) struct RangeResponder {
    body: Vec<u8>,
}

impl RangeResponder {
    pub(crate) fn new(body: Vec<u8>) -> Self {
        Self { body }
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let requested = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range);
        match requested {
            Some((start, end_inclusive)) => {
                let total = self.body.len() as u64;
                let end = (end_inclusive + 1).min(total);
                if start >= end {
                    return ResponseTemplate::new(416);
                }
                ResponseTemplate::new(206)
                    .insert_header(
                        "content-range",
                        format!("bytes {}-{}/{}", start, end - 1, total).as_str(),
                    )
                    .set_body_bytes(self.body[start as usize..end as usize].to_vec())
            }
            None => ResponseTemplate::new(200).set_body_bytes(self.body.clone()),
        }
    }
}

fn parse_range(value: &str) -> Option<(u64, u64)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}
