use std::sync::Arc;

use acme_flow::{
    account::Account,
    challenge::{ChallengeCredential, ChallengeType, VerifyTimeouts},
    jws::Jws,
    key_pair::{KeyAlgorithm, KeyPair},
    order::{OrderBuilder, OrderStatus},
    poll::MockClock,
    session::{Session, SessionBuilder},
    storage::MemStorage,
    transport::{HttpResponse, MockTransport},
};
use openssl::{
    asn1::Asn1Time,
    hash::MessageDigest,
    x509::{X509Builder, X509NameBuilder},
};
use reqwest::{header::LOCATION, Method, StatusCode};
use serde_json::{json, Value};

const DIRECTORY_URL: &str = "https://x/directory";
const ACCOUNT_URL: &str = "https://x/acct/1";
const ORDER_URL: &str = "https://x/order/1";
const CERT_URL: &str = "https://x/cert/1";

fn authorization(value: &str, wildcard: bool, slug: &str, status: &str) -> HttpResponse {
    HttpResponse::new(StatusCode::OK).with_json(&json!({
        "identifier": {"type": "dns", "value": value},
        "status": status,
        "wildcard": wildcard,
        "challenges": [
            {"type": "http-01", "url": format!("https://x/chall/{}/http", slug), "token": format!("tok-{}", slug), "status": "pending"},
            {"type": "dns-01", "url": format!("https://x/chall/{}/dns", slug), "token": format!("tok-{}", slug), "status": "pending"}
        ]
    }))
}

fn order(status: &str, certificate: Option<&str>) -> HttpResponse {
    HttpResponse::new(StatusCode::OK).with_json(&json!({
        "status": status,
        "identifiers": [
            {"type": "dns", "value": "*.example.com"},
            {"type": "dns", "value": "example.com"}
        ],
        "authorizations": ["https://x/authz/wild", "https://x/authz/apex"],
        "finalize": "https://x/order/1/finalize",
        "certificate": certificate
    }))
}

fn certificate_pem(common_name: &str) -> String {
    let key = KeyPair::generate(KeyAlgorithm::Ec, None).unwrap();
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", common_name).unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key.pri_key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(90).unwrap())
        .unwrap();
    builder.sign(&key.pri_key, MessageDigest::sha256()).unwrap();
    String::from_utf8(builder.build().to_pem().unwrap()).unwrap()
}

fn session(transport: Arc<MockTransport>, clock: Arc<MockClock>) -> Arc<Session> {
    transport
        .on(
            Method::GET,
            DIRECTORY_URL,
            HttpResponse::new(StatusCode::OK).with_json(&json!({
                "newAccount": "https://x/acct",
                "newOrder": "https://x/order",
                "newNonce": "https://x/nonce",
                "keyChange": "https://x/key",
                "revokeCert": "https://x/revoke"
            })),
        )
        .on(
            Method::HEAD,
            "https://x/nonce",
            HttpResponse::new(StatusCode::OK).with_nonce("head-nonce"),
        );

    SessionBuilder::new()
        .contact("admin@example.com")
        .directory_url(DIRECTORY_URL)
        .transport(transport)
        .storage(Arc::new(MemStorage::new()))
        .clock(clock)
        .account_key_bits(2048)
        .build()
        .unwrap()
}

fn signed_body(transport: &MockTransport, url: &str) -> Jws {
    let body = transport
        .requests()
        .into_iter()
        .filter(|request| request.url == url)
        .last()
        .and_then(|request| request.body)
        .unwrap();
    serde_json::from_str(&body).unwrap()
}

#[test]
fn test_account_order_challenge_certificate_revoke() {
    let transport = Arc::new(MockTransport::new());
    let clock = Arc::new(MockClock::new());
    let session = session(transport.clone(), clock.clone());

    // 帳戶
    transport.on(
        Method::POST,
        "https://x/acct",
        HttpResponse::new(StatusCode::CREATED)
            .with_header(LOCATION, ACCOUNT_URL)
            .with_nonce("n-1")
            .with_json(&json!({"status": "valid", "contact": ["mailto:admin@example.com"]})),
    );
    let account = Account::init(session.clone()).unwrap();
    assert_eq!(account.url, ACCOUNT_URL);

    transport.on(
        Method::POST,
        ACCOUNT_URL,
        HttpResponse::new(StatusCode::OK)
            .with_json(&json!({"status": "valid", "contact": ["mailto:admin@example.com"]})),
    );
    let resumed = Account::init(session.clone()).unwrap();
    assert_eq!(resumed.url, ACCOUNT_URL);
    assert_eq!(transport.count(&Method::POST, "https://x/acct"), 1);

    // 訂單
    let wild = |status| authorization("example.com", true, "wild", status);
    let apex = |status| authorization("example.com", false, "apex", status);
    transport
        .on(
            Method::POST,
            "https://x/order",
            HttpResponse {
                status: StatusCode::CREATED,
                ..order("pending", None)
            }
            .with_header(LOCATION, ORDER_URL),
        )
        .on(Method::POST, "https://x/authz/wild", wild("pending"))
        .on(Method::POST, "https://x/authz/wild", wild("pending"))
        .on(Method::POST, "https://x/authz/wild", wild("valid"))
        .on(Method::POST, "https://x/authz/apex", apex("pending"))
        .on(Method::POST, "https://x/authz/apex", apex("pending"))
        .on(Method::POST, "https://x/authz/apex", apex("valid"));

    let mut certificate_order = OrderBuilder::new()
        .http01("example.com")
        .dns01("*.example.com")
        .algorithm(KeyAlgorithm::Ec)
        .build(&account)
        .unwrap();
    assert_eq!(certificate_order.url, ORDER_URL);

    // 挑戰
    let services = certificate_order
        .get_pending_challenge_list(&account)
        .unwrap();
    assert_eq!(services.len(), 2);

    for mut service in services {
        match service.credential().clone() {
            ChallengeCredential::Http {
                identifier,
                file_name,
                file_content,
            } => {
                assert_eq!(service.challenge_type(), ChallengeType::Http01);
                assert_eq!(identifier, "example.com");
                assert_eq!(file_content, account.key_authorization("tok-apex").unwrap());
                transport.on(
                    Method::GET,
                    format!("http://example.com/.well-known/acme-challenge/{}", file_name),
                    HttpResponse::new(StatusCode::OK).with_body(file_content),
                );
                transport.on(
                    Method::POST,
                    "https://x/chall/apex/http",
                    HttpResponse::new(StatusCode::OK),
                );
            }
            ChallengeCredential::Dns {
                identifier,
                dns_content,
            } => {
                assert_eq!(service.challenge_type(), ChallengeType::Dns01);
                assert_eq!(identifier, "*.example.com");
                transport.on(
                    Method::GET,
                    "https://dns.google/resolve?name=_acme-challenge.example.com&type=TXT",
                    HttpResponse::new(StatusCode::OK)
                        .with_json(&json!({"Answer": [{"data": format!("\"{}\"", dns_content)}]})),
                );
                transport.on(
                    Method::POST,
                    "https://x/chall/wild/dns",
                    HttpResponse::new(StatusCode::OK),
                );
            }
        }
        service
            .verify(&account, VerifyTimeouts::from_secs(60, 60))
            .unwrap();
    }

    let notify: Value = signed_body(&transport, "https://x/chall/apex/http")
        .payload()
        .unwrap()
        .unwrap();
    assert_eq!(
        notify,
        json!({"keyAuthorization": account.key_authorization("tok-apex").unwrap()})
    );

    // 憑證
    let leaf = certificate_pem("example.com");
    let issuer = certificate_pem("issuer");
    transport
        .on(Method::POST, ORDER_URL, order("ready", None))
        .on(Method::POST, ORDER_URL, order("valid", Some(CERT_URL)))
        .on(Method::POST, "https://x/order/1/finalize", order("processing", None))
        .on(
            Method::POST,
            CERT_URL,
            HttpResponse::new(StatusCode::OK).with_body(format!("{}{}", leaf, issuer)),
        )
        .on(Method::POST, "https://x/revoke", HttpResponse::new(StatusCode::OK));

    let info = certificate_order.get_certificate_file(&account).unwrap();
    assert_eq!(certificate_order.status, OrderStatus::Valid);
    assert_eq!(info.certificate, leaf.trim_end());
    assert_eq!(
        info.certificate_full_chained,
        format!("{}\n{}", leaf.trim_end(), issuer.trim_end())
    );
    assert!(!info.expires_within(30));
    assert!(certificate_order
        .get_pending_challenge_list(&account)
        .unwrap()
        .is_empty());

    // 以相同參數恢復同一張訂單
    let resumed_order = OrderBuilder::new()
        .http01("example.com")
        .dns01("*.example.com")
        .algorithm(KeyAlgorithm::Ec)
        .build(&account)
        .unwrap();
    assert_eq!(resumed_order.url, ORDER_URL);
    assert_eq!(resumed_order.status, OrderStatus::Valid);
    assert_eq!(transport.count(&Method::POST, "https://x/order"), 1);

    // 撤銷
    resumed_order.revoke_certificate(&account, 1).unwrap();
    let revoke = signed_body(&transport, "https://x/revoke");
    let header = revoke.header().unwrap();
    assert!(header.kid.is_none());
    assert_eq!(header.alg, "ES256");
    let payload: Value = revoke.payload().unwrap().unwrap();
    assert_eq!(payload["reason"], 1);
}
