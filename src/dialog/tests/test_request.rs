use super::*;
use crate::rsip_ext::header_contains_token;
use rsip::headers::{Authorization, RecordRoute};

#[tokio::test]
async fn test_create_request_headers() -> crate::Result<()> {
    let env = test_env()?;
    let TestDialog { dialog, .. } = create_uac_dialog(&env, 200, vec![])?;

    let bye = dialog.create_request(Method::Bye)?;
    assert_eq!(bye.method, Method::Bye);
    assert_eq!(bye.uri, Uri::try_from(BOB_CONTACT)?);
    assert_eq!(bye.call_id_header()?.value(), CALL_ID);
    assert_eq!(bye.from_header()?.tag()?.map(|t| t.value().to_string()), Some(ALICE_TAG.to_string()));
    assert_eq!(bye.to_header()?.tag()?.map(|t| t.value().to_string()), Some(BOB_TAG.to_string()));
    assert_eq!(bye.cseq_header()?.seq()?, 2);
    assert_eq!(bye.cseq_header()?.method()?, Method::Bye);
    assert_eq!(header_text(&bye.headers, "Max-Forwards").as_deref(), Some("70"));
    assert_eq!(
        bye.contact_header()?.value(),
        "<sip:alice@192.0.2.99:5060>"
    );
    assert!(header_text(&bye.headers, "Allow").is_none());
    assert!(header_contains_token(&bye.headers, "Supported", "timer"));
    assert!(header_text(&bye.headers, "Session-Expires").is_none());
    assert_eq!(header_text(&bye.headers, "Content-Length").as_deref(), Some("0"));

    let info = dialog.create_request(Method::Info)?;
    assert_eq!(info.cseq_header()?.seq()?, 3);
    assert!(header_contains_token(&info.headers, "Allow", "PRACK"));
    assert_eq!(dialog.local_seq(), 3);
    Ok(())
}

#[tokio::test]
async fn test_invite_carries_session_timer() -> crate::Result<()> {
    let env = test_env()?;
    let TestDialog { dialog, .. } = create_uas_dialog(&env, 200, vec![])?;

    let reinvite = dialog.create_request(Method::Invite)?;
    assert_eq!(reinvite.cseq_header()?.seq()?, 1);
    assert_eq!(
        header_text(&reinvite.headers, "Session-Expires").as_deref(),
        Some("1800;refresher=uac")
    );
    assert_eq!(header_text(&reinvite.headers, "Min-SE").as_deref(), Some("90"));
    // UAS requests go to the caller's Contact, with the tags swapped
    assert_eq!(reinvite.uri, Uri::try_from(ALICE_CONTACT)?);
    assert_eq!(
        reinvite.from_header()?.tag()?.map(|t| t.value().to_string()),
        Some(BOB_TAG.to_string())
    );
    Ok(())
}

#[tokio::test]
async fn test_ack_keeps_sequence() -> crate::Result<()> {
    let env = test_env()?;
    let TestDialog { dialog, .. } = create_uac_dialog(&env, 200, vec![])?;

    let ack = dialog.create_request(Method::Ack)?;
    assert_eq!(ack.cseq_header()?.seq()?, 1);
    assert_eq!(ack.cseq_header()?.method()?, Method::Ack);
    assert!(header_text(&ack.headers, "Supported").is_none());
    assert!(header_text(&ack.headers, "Allow").is_none());
    assert_eq!(dialog.local_seq(), 1);
    Ok(())
}

#[tokio::test]
async fn test_loose_route_set() -> crate::Result<()> {
    let env = test_env()?;
    let extra = vec![
        RecordRoute::new("<sip:p1.example.com;lr>").into(),
        RecordRoute::new("<sip:p2.example.com;lr>").into(),
    ];
    let TestDialog { dialog, .. } = create_uac_dialog(&env, 200, extra)?;

    let info = dialog.create_request(Method::Info)?;
    assert_eq!(info.uri, Uri::try_from(BOB_CONTACT)?);
    let routes: Vec<String> = info
        .headers
        .iter()
        .filter_map(|h| match h {
            Header::Route(route) => Some(route.value().to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(routes, vec!["<sip:p2.example.com;lr>", "<sip:p1.example.com;lr>"]);
    assert_eq!(dialog.next_hop(&info), Uri::try_from("sip:p2.example.com;lr")?);

    dialog.create_transaction(info)?;
    assert_eq!(
        env.transactions.targets().last(),
        Some(&Uri::try_from("sip:p2.example.com;lr")?)
    );
    Ok(())
}

#[tokio::test]
async fn test_strict_route_set() -> crate::Result<()> {
    let env = test_env()?;
    let extra = vec![
        RecordRoute::new("<sip:p1.example.com;lr>").into(),
        RecordRoute::new("<sip:strict.example.com;transport=tcp>").into(),
    ];
    let TestDialog { dialog, .. } = create_uac_dialog(&env, 200, extra)?;

    let info = dialog.create_request(Method::Info)?;
    assert_eq!(info.uri, Uri::try_from("sip:strict.example.com;transport=tcp")?);
    let routes: Vec<String> = info
        .headers
        .iter()
        .filter_map(|h| match h {
            Header::Route(route) => Some(route.value().to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(
        routes,
        vec![
            "<sip:p1.example.com;lr>".to_string(),
            format!("<{}>", BOB_CONTACT)
        ]
    );
    // the strict router in the Request-URI is the first hop, not the next Route
    let strict = Uri::try_from("sip:strict.example.com;transport=tcp")?;
    assert_eq!(dialog.next_hop(&info), strict);

    dialog.create_transaction(info)?;
    assert_eq!(env.transactions.targets().last(), Some(&strict));

    dialog.terminate();
    let bye = env
        .transactions
        .last(Method::Bye, TransactionRole::Client)
        .expect("bye transaction");
    assert_eq!(bye.request().uri, strict);
    assert_eq!(env.transactions.targets().last(), Some(&strict));
    Ok(())
}

#[tokio::test]
async fn test_create_request_with_overrides() -> crate::Result<()> {
    let env = test_env()?;
    let TestDialog { dialog, .. } = create_uac_dialog(&env, 200, vec![])?;

    let body = b"Signal=5\r\nDuration=160\r\n".to_vec();
    let info = dialog.create_request_with(
        Method::Info,
        vec![
            Header::Supported("100rel".into()),
            ContentType::new("application/dtmf-relay").into(),
        ],
        Some(body.clone()),
    )?;
    assert_eq!(header_text(&info.headers, "Supported").as_deref(), Some("100rel"));
    assert_eq!(
        info.headers
            .iter()
            .filter(|h| matches!(h, Header::Supported(_)))
            .count(),
        1
    );
    assert_eq!(
        header_text(&info.headers, "Content-Type").as_deref(),
        Some("application/dtmf-relay")
    );
    assert_eq!(
        header_text(&info.headers, "Content-Length"),
        Some(body.len().to_string())
    );
    assert_eq!(info.body, body);
    Ok(())
}

#[tokio::test]
async fn test_ack_for_2xx_copies_invite() -> crate::Result<()> {
    let env = test_env()?;
    let request = invite_request(
        "z9hG4bKauth",
        vec![Authorization::new("Digest username=\"alice\", realm=\"atlanta.example.com\"").into()],
    );
    let invite = MockTransaction::new(request, TransactionRole::Client);
    let ok = response_to(invite.request(), 200, Some(BOB_TAG), vec![contact(BOB_CONTACT)]);
    let (sender, _events) = env.layer.new_dialog_event_channel();
    env.layer.create_dialog(&invite.tx_ref(), &ok, sender)?;

    let sent = env.transport.requests();
    assert_eq!(sent.len(), 1);
    let ack = &sent[0];
    assert_eq!(ack.method, Method::Ack);
    assert_eq!(ack.cseq_header()?.seq()?, 1);
    assert_eq!(
        ack.via_header()?.value(),
        invite.request().via_header()?.value()
    );
    assert!(ack
        .headers
        .iter()
        .any(|h| matches!(h, Header::Authorization(_))));
    Ok(())
}
