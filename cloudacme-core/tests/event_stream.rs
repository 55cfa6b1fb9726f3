//! A full event stream through the JSON-lines loop.

use cloudacme_core::{
    AlbTargetGroupResponse, EventResponse, RenewalResponse, TriggerEvent, serve_json_lines,
};
use tokio::io::BufReader;

const INPUT: &str = concat!(
    r#"{"domain":"example.test","albArn":"arn:lb"}"#,
    "\n",
    "not json\n",
    r#"{"httpMethod":"GET","path":"/","headers":{"host":"example.test"},"requestContext":{"elb":{"targetGroupArn":"arn:tg"}}}"#,
    "\n",
);

#[tokio::test]
async fn test_each_line_gets_one_response_line() {
    let mut reader = BufReader::new(INPUT.as_bytes());
    let mut output = Vec::new();

    serve_json_lines(
        &mut reader,
        &mut output,
        |event: TriggerEvent| async move {
            match event {
                TriggerEvent::Renewal(renewal) => EventResponse::Renewal(RenewalResponse::Ok {
                    domain: renewal.domain,
                    outcome: "unchanged".to_string(),
                }),
                TriggerEvent::Request(request) => EventResponse::Http(
                    AlbTargetGroupResponse::redirect(format!(
                        "https://{}/",
                        request.host().unwrap_or_default()
                    )),
                ),
            }
        },
        |e| {
            EventResponse::Renewal(RenewalResponse::Error {
                message: e.to_string(),
            })
        },
    )
    .await
    .unwrap();

    let lines: Vec<EventResponse> = String::from_utf8(output)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 3);

    assert_eq!(
        lines[0],
        EventResponse::Renewal(RenewalResponse::Ok {
            domain: "example.test".to_string(),
            outcome: "unchanged".to_string(),
        })
    );
    assert!(matches!(
        lines[1],
        EventResponse::Renewal(RenewalResponse::Error { .. })
    ));
    let EventResponse::Http(ref redirect) = lines[2] else {
        panic!("expected an HTTP response, got {:?}", lines[2]);
    };
    assert_eq!(redirect.location(), Some("https://example.test/"));
}
