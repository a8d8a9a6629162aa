mod common;

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use coffre_collections::mail::mailbox::{FlagOp, MailboxEvent};
use coffre_collections::mail::namespace::INBOX;
use coffre_collections::mail::record::DELETED;
use coffre_collections::Error;
use coffre_user::config::DedupPolicy;
use coffre_user::cryptoblob::CryptoKeys;
use coffre_user::storage::in_memory::MemBuilder;

use common::*;

fn paths(records: Vec<coffre_collections::mail::namespace::MailboxRecord>) -> Vec<String> {
    records.into_iter().map(|r| r.path).collect()
}

#[tokio::test]
async fn inbox_exists_from_the_start() {
    let t = open_account().await;
    assert_eq!(paths(t.account.list("", "*").await.unwrap()), vec![INBOX]);
    assert_eq!(paths(t.account.lsub("", "*").await.unwrap()), vec![INBOX]);

    let status = t.account.status("inbox").await.unwrap();
    assert_eq!(status.messages, 0);
    assert_eq!(status.uidnext.get(), 1);
}

#[tokio::test]
async fn create_makes_parents_and_rejects_duplicates() {
    let t = open_account().await;
    t.account.create("Work/2023/Q1/").await.unwrap();
    assert_eq!(
        paths(t.account.list("", "*").await.unwrap()),
        vec!["INBOX", "Work", "Work/2023", "Work/2023/Q1"]
    );
    assert_eq!(paths(t.account.list("Work", "%").await.unwrap()), vec!["Work/2023"]);

    assert_eq!(
        t.account.create("Work/2023").await,
        Err(Error::MailboxExists("Work/2023".into()))
    );
    assert_eq!(
        t.account.create("INBOX").await,
        Err(Error::MailboxExists("INBOX".into()))
    );
    assert!(matches!(
        t.account.create("a//b").await,
        Err(Error::InvalidMailboxName(_))
    ));
}

#[tokio::test]
async fn delete_keeps_placeholders_for_inferiors() {
    let t = open_account().await;
    t.account.create("Work/Old").await.unwrap();
    let work = t.account.open_mailbox("Work").await.unwrap();
    work.append(message("to be destroyed"), vec![], None).await.unwrap();

    t.account.delete("Work").await.unwrap();
    let tree = t.account.tree().await.unwrap();
    assert!(tree.get("Work").unwrap().value.noselect);
    assert_eq!(
        t.account.open_mailbox("Work").await.err(),
        Some(Error::MailboxNotFound("Work".into()))
    );
    assert!(matches!(work.summary().await, Err(Error::MailboxNotFound(_))));

    assert_eq!(
        t.account.delete("Work").await,
        Err(Error::HasInferiors("Work".into()))
    );
    t.account.delete("Work/Old").await.unwrap();
    t.account.delete("Work").await.unwrap();
    assert_eq!(paths(t.account.list("", "*").await.unwrap()), vec![INBOX]);

    assert!(matches!(t.account.delete("INBOX").await, Err(Error::InvalidMailboxName(_))));
    assert_eq!(
        t.account.delete("Nope").await,
        Err(Error::MailboxNotFound("Nope".into()))
    );
}

#[tokio::test]
async fn recreated_mailbox_gets_a_new_uidvalidity() {
    let t = open_account().await;
    let first = t.account.create("Drafts").await.unwrap();
    t.account.delete("Drafts").await.unwrap();
    let second = t.account.create("Drafts").await.unwrap();
    assert!(second.uidvalidity > first.uidvalidity);

    let mb = t.account.open_mailbox("Drafts").await.unwrap();
    assert_eq!(mb.summary().await.unwrap().exists, 0);
}

#[tokio::test]
async fn rename_moves_inferiors() {
    let t = open_account().await;
    t.account.create("Projects/A").await.unwrap();
    t.account.create("Archive").await.unwrap();
    let a = t.account.open_mailbox("Projects/A").await.unwrap();
    a.append(message("keep me"), vec![], None).await.unwrap();

    assert_eq!(
        t.account.rename("Projects", "Archive").await,
        Err(Error::MailboxExists("Archive".into()))
    );
    assert_eq!(
        t.account.rename("Nope", "Elsewhere").await,
        Err(Error::MailboxNotFound("Nope".into()))
    );

    t.account.rename("Projects", "Old/Projects").await.unwrap();
    assert_eq!(
        paths(t.account.list("", "*").await.unwrap()),
        vec!["Archive", "INBOX", "Old", "Old/Projects", "Old/Projects/A"]
    );

    let moved = t.account.open_mailbox("Old/Projects/A").await.unwrap();
    assert_eq!(moved.id(), a.id());
    assert_eq!(moved.status().await.unwrap().messages, 1);
}

#[tokio::test]
async fn renaming_inbox_leaves_an_empty_one() {
    let t = open_account().await;
    let inbox = t.account.open_mailbox("INBOX").await.unwrap();
    inbox.append(message("old mail"), vec![], None).await.unwrap();

    t.account.rename("INBOX", "Saved").await.unwrap();
    assert_eq!(t.account.status("Saved").await.unwrap().messages, 1);
    assert_eq!(t.account.status("INBOX").await.unwrap().messages, 0);
    assert_ne!(t.account.open_mailbox("INBOX").await.unwrap().id(), inbox.id());
}

#[tokio::test]
async fn subscriptions() {
    let t = open_account().await;
    t.account.create("Lists/rust").await.unwrap();

    assert_eq!(
        t.account.unsubscribe("Lists/rust").await,
        Err(Error::NotSubscribed("Lists/rust".into()))
    );
    t.account.subscribe("Lists/rust").await.unwrap();
    t.account.subscribe("Lists/rust").await.unwrap();
    assert_eq!(
        paths(t.account.lsub("", "*").await.unwrap()),
        vec!["INBOX", "Lists/rust"]
    );

    t.account.unsubscribe("Lists/rust").await.unwrap();
    assert_eq!(paths(t.account.lsub("", "*").await.unwrap()), vec!["INBOX"]);
    assert_eq!(
        t.account.subscribe("Nope").await,
        Err(Error::MailboxNotFound("Nope".into()))
    );
}

#[tokio::test]
async fn handles_are_shared() {
    let t = open_account().await;
    let a = t.account.open_mailbox("INBOX").await.unwrap();
    let b = t.account.open_mailbox("INBOX").await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));
}

#[tokio::test]
async fn mail_from_another_process_is_announced() {
    let builder = MemBuilder::new();
    let keys = CryptoKeys::init();
    let here = open_on(Arc::new(builder.store()), &keys, DedupPolicy::None).await;
    let there = open_on(Arc::new(builder.store()), &keys, DedupPolicy::None).await;

    let inbox_here = here.account.open_mailbox("INBOX").await.unwrap();
    let mut events = inbox_here.subscribe();

    let inbox_there = there.account.open_mailbox("INBOX").await.unwrap();
    assert_eq!(inbox_there.id(), inbox_here.id());
    inbox_there.append(message("remote"), vec![], None).await.unwrap();

    let evt = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("an event within the timeout")
        .unwrap();
    assert_eq!(evt, MailboxEvent::Exists(1));
}

async fn next_event(events: &mut broadcast::Receiver<MailboxEvent>) -> MailboxEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("an event within the timeout")
        .unwrap()
}

#[tokio::test]
async fn flag_changes_and_expunges_from_another_process_are_announced() {
    let builder = MemBuilder::new();
    let keys = CryptoKeys::init();
    let here = open_on(Arc::new(builder.store()), &keys, DedupPolicy::None).await;
    let there = open_on(Arc::new(builder.store()), &keys, DedupPolicy::None).await;

    let inbox_here = here.account.open_mailbox("INBOX").await.unwrap();
    let mut events = inbox_here.subscribe();
    let inbox_there = there.account.open_mailbox("INBOX").await.unwrap();
    for subject in ["one", "two", "three"] {
        inbox_there.append(message(subject), vec![], None).await.unwrap();
    }

    // appends may be seen one by one or all at once
    loop {
        match next_event(&mut events).await {
            MailboxEvent::Exists(3) => break,
            MailboxEvent::Exists(_) => continue,
            other => panic!("unexpected event {:?}", other),
        }
    }

    inbox_there
        .set_flags(&"2".parse().unwrap(), true, FlagOp::Add, vec![DELETED.into()], false)
        .await
        .unwrap();
    match next_event(&mut events).await {
        MailboxEvent::FlagsChanged { uid, flags } => {
            assert_eq!(uid.get(), 2);
            assert!(flags.contains(&DELETED.to_string()));
        }
        other => panic!("unexpected event {:?}", other),
    }

    inbox_there.expunge().await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        MailboxEvent::Expunged(NonZeroU32::new(2).unwrap())
    );

    // the removal comes before the arrival that follows it
    inbox_there
        .set_flags(&"1".parse().unwrap(), true, FlagOp::Add, vec![DELETED.into()], true)
        .await
        .unwrap();
    inbox_there.expunge().await.unwrap();
    inbox_there.append(message("four"), vec![], None).await.unwrap();

    let mut seen = vec![];
    while seen.last() != Some(&MailboxEvent::Exists(2)) {
        seen.push(next_event(&mut events).await);
    }
    let expunged_at = seen
        .iter()
        .position(|e| *e == MailboxEvent::Expunged(NonZeroU32::new(1).unwrap()))
        .expect("the expunge is announced");
    assert!(expunged_at < seen.len() - 1);
    assert_eq!(inbox_here.summary().await.unwrap().exists, 2);
}
