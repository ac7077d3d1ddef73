use chrono::{DateTime, TimeZone, Utc};
use shared::domain::{ChatId, ChatKind, ContactId, ContentKind, Direction, MessageId};
use storage::{ChatQuery, ChatSort, MessageQuery, MessageUpsert, Storage};

const ALICE: &str = "15550001@s.whatsapp.net";
const BOB: &str = "15550002@s.whatsapp.net";
const GROUP: &str = "120363001@g.us";

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
}

fn message(chat: &str, id: &str, sender: &str, text: &str, seconds: i64) -> MessageUpsert {
    MessageUpsert {
        chat_id: ChatId::from(chat),
        message_id: MessageId::from(id),
        sender_id: ContactId::from(sender),
        sender_name: None,
        chat_name: None,
        timestamp: at(seconds),
        direction: Direction::Inbound,
        kind: ContentKind::Text,
        text: Some(text.to_string()),
        quoted_message_id: None,
        delivery_status: None,
        media: None,
        local_media_path: None,
    }
}

async fn seeded() -> Storage {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .upsert_chat(&ChatId::from(ALICE), Some("Alice"), None)
        .await
        .expect("alice chat");
    storage
        .upsert_chat(&ChatId::from(GROUP), Some("Book Club"), None)
        .await
        .expect("group chat");
    storage
        .upsert_contact(&ContactId::from(BOB), Some("Bob"))
        .await
        .expect("bob");

    for (chat, id, sender, text, seconds) in [
        (ALICE, "a1", ALICE, "morning", 0),
        (ALICE, "a2", ALICE, "lunch later?", 10),
        (GROUP, "g1", BOB, "chapter three", 20),
        (GROUP, "g2", ALICE, "loved the ending", 30),
        (GROUP, "g3", BOB, "Lunch on friday", 40),
        (ALICE, "a3", ALICE, "see you", 50),
    ] {
        storage
            .upsert_message(&message(chat, id, sender, text, seconds))
            .await
            .expect("seed message");
    }
    storage
}

#[tokio::test]
async fn lists_messages_newest_first_with_filters() {
    let storage = seeded().await;

    let all = storage
        .list_messages(&MessageQuery::default())
        .await
        .expect("all");
    let ids: Vec<_> = all.iter().map(|m| m.message_id.as_str()).collect();
    assert_eq!(ids, ["a3", "g3", "g2", "g1", "a2", "a1"]);

    let lunch = storage
        .list_messages(&MessageQuery {
            text: Some("LUNCH".to_string()),
            ..MessageQuery::default()
        })
        .await
        .expect("text filter");
    assert_eq!(lunch.len(), 2);

    let bob_by_phone = storage
        .list_messages(&MessageQuery {
            sender: Some("15550002".to_string()),
            chat_id: Some(ChatId::from(GROUP)),
            after: Some(at(20)),
            ..MessageQuery::default()
        })
        .await
        .expect("sender filter");
    assert_eq!(bob_by_phone.len(), 1);
    assert_eq!(bob_by_phone[0].message_id.as_str(), "g3");
    assert_eq!(bob_by_phone[0].chat_name.as_deref(), Some("Book Club"));
}

#[tokio::test]
async fn pages_through_messages() {
    let storage = seeded().await;
    let second_page = storage
        .list_messages(&MessageQuery {
            limit: 2,
            page: 1,
            ..MessageQuery::default()
        })
        .await
        .expect("page");
    let ids: Vec<_> = second_page.iter().map(|m| m.message_id.as_str()).collect();
    assert_eq!(ids, ["g2", "g1"]);
}

#[tokio::test]
async fn context_is_chronological_and_scoped_to_the_chat() {
    let storage = seeded().await;
    let context = storage
        .message_context(&ChatId::from(ALICE), &MessageId::from("a2"), 5, 5)
        .await
        .expect("context")
        .expect("anchor exists");

    assert_eq!(context.message.text.as_deref(), Some("lunch later?"));
    let before: Vec<_> = context.before.iter().map(|m| m.message_id.as_str()).collect();
    let after: Vec<_> = context.after.iter().map(|m| m.message_id.as_str()).collect();
    assert_eq!(before, ["a1"]);
    assert_eq!(after, ["a3"]);

    assert!(storage
        .message_context(&ChatId::from(ALICE), &MessageId::from("missing"), 5, 5)
        .await
        .expect("context")
        .is_none());
}

#[tokio::test]
async fn lists_chats_by_activity_or_name() {
    let storage = seeded().await;

    let by_activity = storage
        .list_chats(&ChatQuery::default())
        .await
        .expect("chats");
    assert_eq!(by_activity[0].chat_id.as_str(), ALICE);
    let last = by_activity[0].last_message.as_ref().expect("last message");
    assert_eq!(last.text.as_deref(), Some("see you"));

    let by_name = storage
        .list_chats(&ChatQuery {
            sort: ChatSort::Name,
            include_last_message: false,
            ..ChatQuery::default()
        })
        .await
        .expect("chats");
    let names: Vec<_> = by_name.iter().map(|c| c.name.as_deref()).collect();
    assert_eq!(names, [Some("Alice"), Some("Book Club")]);
    assert!(by_name.iter().all(|c| c.last_message.is_none()));

    let filtered = storage
        .list_chats(&ChatQuery {
            query: Some("book".to_string()),
            ..ChatQuery::default()
        })
        .await
        .expect("chats");
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].kind, ChatKind::Group);
}

#[tokio::test]
async fn contact_lookups_exclude_groups() {
    let storage = seeded().await;

    let found = storage.search_contacts("b", 50).await.expect("search");
    assert!(found.iter().all(|c| !c.contact_id.as_str().ends_with("@g.us")));
    assert!(found.iter().any(|c| c.name.as_deref() == Some("Bob")));

    let by_phone = storage.search_contacts("15550001", 50).await.expect("search");
    assert_eq!(by_phone.len(), 1);
    assert_eq!(by_phone[0].phone_number(), "15550001");

    let direct = storage
        .direct_chat_by_contact("15550001")
        .await
        .expect("direct")
        .expect("present");
    assert_eq!(direct.chat_id.as_str(), ALICE);

    let alice_chats = storage
        .contact_chats(&ContactId::from(ALICE), 20, 0)
        .await
        .expect("contact chats");
    assert_eq!(alice_chats.len(), 2);

    let last = storage
        .last_interaction(&ContactId::from(BOB))
        .await
        .expect("last")
        .expect("present");
    assert_eq!(last.message_id.as_str(), "g3");

    assert_eq!(storage.sender_display_name(BOB).await.expect("name"), "Bob");
    assert_eq!(
        storage
            .sender_display_name("15559999@s.whatsapp.net")
            .await
            .expect("name"),
        "15559999@s.whatsapp.net"
    );
}

#[tokio::test]
async fn wildcard_characters_in_filters_match_literally() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .upsert_contact(&ContactId::from("15550010@s.whatsapp.net"), Some("Ann_Lee"))
        .await
        .expect("ann underscore");
    storage
        .upsert_contact(&ContactId::from("15550011@s.whatsapp.net"), Some("AnnXLee"))
        .await
        .expect("ann x");
    storage
        .upsert_chat(&ChatId::from(GROUP), Some("100% Club"), None)
        .await
        .expect("percent chat");
    storage
        .upsert_chat(&ChatId::from(ALICE), Some("1000 Club"), None)
        .await
        .expect("plain chat");
    for (chat, id, text, seconds) in [
        (GROUP, "p1", "100% sure", 0),
        (ALICE, "p2", "1000 reasons", 10),
        (ALICE, "p3", r"C:\temp", 20),
    ] {
        storage
            .upsert_message(&message(chat, id, ALICE, text, seconds))
            .await
            .expect("seed message");
    }

    let contacts = storage.search_contacts("n_l", 10).await.expect("contacts");
    let names: Vec<_> = contacts.iter().filter_map(|c| c.name.as_deref()).collect();
    assert_eq!(names, ["Ann_Lee"]);
    assert!(storage
        .search_contacts("%", 10)
        .await
        .expect("percent contacts")
        .is_empty());

    let percent = storage
        .list_messages(&MessageQuery {
            text: Some("100%".to_string()),
            ..MessageQuery::default()
        })
        .await
        .expect("percent text");
    let ids: Vec<_> = percent.iter().map(|m| m.message_id.as_str()).collect();
    assert_eq!(ids, ["p1"]);

    let backslash = storage
        .list_messages(&MessageQuery {
            text: Some(r"c:\t".to_string()),
            ..MessageQuery::default()
        })
        .await
        .expect("backslash text");
    assert_eq!(backslash.len(), 1);

    let chats = storage
        .list_chats(&ChatQuery {
            query: Some("100%".to_string()),
            ..ChatQuery::default()
        })
        .await
        .expect("chats");
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0].chat_id.as_str(), GROUP);

    assert!(storage
        .direct_chat_by_contact("1555000_")
        .await
        .expect("direct chat")
        .is_none());
}
