//! End-to-end service tests: conversations, message delivery, unread
//! counters and notifications, with registry-attached receivers standing in
//! for connected clients.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use solace_api::conversations::{conversation_detail, create_conversation, list_conversations};
use solace_api::error::ApiError;
use solace_api::messages::{deliver_to_absent_members, list_messages, send_message};
use solace_api::notifications::{
    delete_one, list_notifications, mark_all_read, mark_read, notify_comment, notify_follow,
    notify_followers_of_new_post, notify_like, notify_post_approved, notify_post_submitted,
    notify_report_processed, notify_report_to_admins, unread_total,
};
use solace_api::{AppState, AppStateInner};
use solace_db::Database;
use solace_gateway::connection::Session;
use solace_types::api::{
    CreateConversationRequest, ImageInput, MessageResponse, PageQuery, SendMessageRequest,
};
use solace_types::events::{ClientCommand, ServerEvent};
use solace_types::models::{ConversationKind, NotificationKind, NotificationView};

fn state() -> AppState {
    AppStateInner::new(Arc::new(Database::open_in_memory().unwrap()), "test-secret")
}

fn user(state: &AppState, first: &str, last: &str) -> Uuid {
    let id = Uuid::new_v4();
    state.db.create_user(&id.to_string(), first, last, None, "user").unwrap();
    id
}

fn admin(state: &AppState, first: &str) -> Uuid {
    let id = Uuid::new_v4();
    state.db.create_user(&id.to_string(), first, "Admin", None, "admin").unwrap();
    id
}

struct Client {
    session: Session,
    user_id: Uuid,
    rx: UnboundedReceiver<ServerEvent>,
}

impl Client {
    async fn connect(state: &AppState, user_id: Uuid) -> Self {
        let (conn_id, rx) = state.dispatcher.connect().await;
        let session = Session::new(conn_id, Some(user_id), state.dispatcher.clone(), state.unread.clone());
        session.handle_command(ClientCommand::Register(Some(user_id.to_string()))).await;
        let mut client = Self {
            session,
            user_id,
            rx,
        };
        client.drain();
        client
    }

    async fn join(&mut self, conversation_id: Uuid) {
        self.session
            .handle_command(ClientCommand::JoinConversation {
                user_id: Some(self.user_id),
                conversation_id: Some(conversation_id),
            })
            .await;
    }

    fn drain(&mut self) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            out.push(event);
        }
        out
    }

    /// Drops presence snapshots, which arrive whenever anyone connects.
    fn drain_messages(&mut self) -> Vec<ServerEvent> {
        self.drain()
            .into_iter()
            .filter(|e| !matches!(e, ServerEvent::OnlineUsers(_)))
            .collect()
    }
}

async fn direct(state: &AppState, a: Uuid, b: Uuid) -> Uuid {
    let created = create_conversation(
        state,
        a,
        CreateConversationRequest {
            members: vec![b],
            kind: ConversationKind::Direct,
            name: String::new(),
            avatar_group: None,
        },
    )
    .await
    .unwrap();
    created.conversation.id
}

fn text(content: &str) -> SendMessageRequest {
    SendMessageRequest {
        content: Some(content.to_string()),
        ..Default::default()
    }
}

/// Send path as the HTTP handler runs it, with the fan-out awaited.
async fn send(state: &AppState, conversation_id: Uuid, sender: Uuid, req: SendMessageRequest) -> MessageResponse {
    let sent = send_message(state, conversation_id, sender, req).await.unwrap();
    let message = sent.message.clone();
    deliver_to_absent_members(state.clone(), sent).await;
    message
}

fn unread(state: &AppState, user_id: Uuid, conversation_id: Uuid) -> Option<i64> {
    state
        .db
        .unread_count(&user_id.to_string(), &conversation_id.to_string())
        .unwrap()
}

#[tokio::test]
async fn direct_conversation_is_created_once_per_pair() {
    let state = state();
    let (a, b) = (user(&state, "An", "Tran"), user(&state, "Binh", "Le"));

    let req = |members: Vec<Uuid>| CreateConversationRequest {
        members,
        kind: ConversationKind::Direct,
        name: String::new(),
        avatar_group: None,
    };

    let first = create_conversation(&state, a, req(vec![b])).await.unwrap();
    let again = create_conversation(&state, a, req(vec![b, a])).await.unwrap();
    let reversed = create_conversation(&state, b, req(vec![a])).await.unwrap();

    assert!(first.is_new);
    assert!(!again.is_new && !reversed.is_new);
    assert_eq!(first.conversation.id, again.conversation.id);
    assert_eq!(first.conversation.id, reversed.conversation.id);

    let mut members = first.conversation.members.unwrap();
    members.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(members, expected);

    // Direct conversations are named after the other participant
    assert_eq!(first.conversation.name, "Binh Le");
    assert_eq!(reversed.conversation.name, "An Tran");
    assert_eq!(list_conversations(&state, a, &PageQuery::default()).await.unwrap().total, 1);
}

#[tokio::test]
async fn create_validates_members() {
    let state = state();
    let (a, b, c) = (
        user(&state, "An", "Tran"),
        user(&state, "Binh", "Le"),
        user(&state, "Chi", "Pham"),
    );
    let req = |kind, members: Vec<Uuid>, name: &str| CreateConversationRequest {
        members,
        kind,
        name: name.to_string(),
        avatar_group: None,
    };

    let with_self = create_conversation(&state, a, req(ConversationKind::Direct, vec![a], "")).await;
    assert!(matches!(with_self, Err(ApiError::Validation(_))));

    let stranger = create_conversation(&state, a, req(ConversationKind::Direct, vec![Uuid::new_v4()], "")).await;
    assert!(matches!(stranger, Err(ApiError::NotFound(_))));

    let unnamed = create_conversation(&state, a, req(ConversationKind::Group, vec![b, c], "  ")).await;
    assert!(matches!(unnamed, Err(ApiError::Validation(_))));

    let group = create_conversation(&state, a, req(ConversationKind::Group, vec![b, c, b, a], " Trip ")).await.unwrap();
    assert!(group.is_new);
    assert_eq!(group.conversation.name, "Trip");
    assert_eq!(group.conversation.members.unwrap().len(), 3);
    assert!(group.conversation.other_user.is_none());
}

#[tokio::test]
async fn absent_recipient_accumulates_unread_until_joining() {
    let state = state();
    let (a, b) = (user(&state, "An", "Tran"), user(&state, "Binh", "Le"));
    let mut alice = Client::connect(&state, a).await;
    let mut bob = Client::connect(&state, b).await;
    alice.drain();

    let convo = direct(&state, a, b).await;
    let hi = send(&state, convo, a, text("hi")).await;

    assert_eq!(unread(&state, b, convo), Some(1));
    assert_eq!(
        bob.drain_messages(),
        vec![
            ServerEvent::NewMessage(hi.clone()),
            ServerEvent::UnreadTotalUpdated { total: 1 }
        ]
    );
    // The sender never counts their own message
    assert_eq!(unread(&state, a, convo), Some(0));
    assert!(alice.drain_messages().is_empty());

    let listed = list_conversations(&state, b, &PageQuery::default()).await.unwrap();
    assert_eq!(listed.conversations[0].unread_count, 1);
    assert_eq!(listed.conversations[0].last_message, "hi");
    assert_eq!(listed.conversations[0].other_user.as_ref().unwrap().id, a);

    bob.join(convo).await;
    assert_eq!(bob.drain_messages(), vec![ServerEvent::UnreadTotalUpdated { total: 0 }]);
    assert_eq!(unread(&state, b, convo), Some(0));

    // Joining again is harmless
    bob.join(convo).await;
    assert_eq!(unread(&state, b, convo), Some(0));
}

#[tokio::test]
async fn live_members_receive_in_the_room_without_counting() {
    let state = state();
    let (a, b) = (user(&state, "An", "Tran"), user(&state, "Binh", "Le"));
    let convo = direct(&state, a, b).await;
    let mut bob = Client::connect(&state, b).await;
    bob.join(convo).await;
    bob.drain();

    for i in 0..3 {
        send(&state, convo, a, text(&format!("m{i}"))).await;
    }

    let events = bob.drain_messages();
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|e| matches!(e, ServerEvent::NewMessage(_))));
    assert_eq!(unread(&state, b, convo), Some(0));
}

#[tokio::test]
async fn offline_members_count_every_message() {
    let state = state();
    let (a, b) = (user(&state, "An", "Tran"), user(&state, "Binh", "Le"));
    let convo = direct(&state, a, b).await;

    for i in 0..5 {
        send(&state, convo, a, text(&format!("m{i}"))).await;
    }
    assert_eq!(unread(&state, b, convo), Some(5));
    assert_eq!(state.unread.total(b).await.unwrap(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn room_order_matches_storage_order() {
    let state = state();
    let (a, b) = (user(&state, "An", "Tran"), user(&state, "Binh", "Le"));
    let convo = direct(&state, a, b).await;
    let mut observer = Client::connect(&state, b).await;
    observer.join(convo).await;
    observer.drain();

    let mut tasks = Vec::new();
    for i in 0..24 {
        let state = state.clone();
        let sender = if i % 2 == 0 { a } else { b };
        tasks.push(tokio::spawn(async move {
            send_message(&state, convo, sender, text(&format!("m{i}"))).await.unwrap()
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let delivered: Vec<Uuid> = observer
        .drain_messages()
        .into_iter()
        .filter_map(|e| match e {
            ServerEvent::NewMessage(m) => Some(m.id),
            _ => None,
        })
        .collect();

    let query = PageQuery {
        limit: Some(100),
        ..Default::default()
    };
    let mut stored: Vec<Uuid> = list_messages(&state, convo, a, &query)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    stored.reverse();

    assert_eq!(delivered.len(), 24);
    assert_eq!(delivered, stored);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn absent_delivery_follows_commit_order() {
    let state = state();
    let (a, b) = (user(&state, "An", "Tran"), user(&state, "Binh", "Le"));
    let convo = direct(&state, a, b).await;
    let mut bob = Client::connect(&state, b).await;

    // Each send spawns its own fan-out, as the HTTP handler does
    let mut sends = Vec::new();
    for i in 0..16 {
        let state = state.clone();
        sends.push(tokio::spawn(async move {
            let sent = send_message(&state, convo, a, text(&format!("m{i}"))).await.unwrap();
            tokio::spawn(deliver_to_absent_members(state.clone(), sent))
        }));
    }
    for send in sends {
        send.await.unwrap().await.unwrap();
    }

    let mut delivered = Vec::new();
    let mut totals = Vec::new();
    for event in bob.drain_messages() {
        match event {
            ServerEvent::NewMessage(m) => delivered.push(m.id),
            ServerEvent::UnreadTotalUpdated { total } => totals.push(total),
            other => panic!("unexpected {:?}", other),
        }
    }

    let query = PageQuery {
        limit: Some(100),
        ..Default::default()
    };
    let mut stored: Vec<Uuid> = list_messages(&state, convo, a, &query)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    stored.reverse();

    assert_eq!(delivered, stored);
    assert_eq!(totals, (1..=16).collect::<Vec<i64>>());
    assert_eq!(unread(&state, b, convo), Some(16));
}

#[tokio::test]
async fn outsiders_cannot_send_or_read() {
    let state = state();
    let (a, b, eve) = (
        user(&state, "An", "Tran"),
        user(&state, "Binh", "Le"),
        user(&state, "Eve", "Nguyen"),
    );
    let convo = direct(&state, a, b).await;
    let mut bob = Client::connect(&state, b).await;
    bob.join(convo).await;
    bob.drain();

    let res = send_message(&state, convo, eve, text("let me in")).await;
    assert!(matches!(res, Err(ApiError::Forbidden(_))));
    assert!(bob.drain_messages().is_empty());
    assert!(list_messages(&state, convo, a, &PageQuery::default()).await.unwrap().is_empty());

    let read = list_messages(&state, convo, eve, &PageQuery::default()).await;
    assert!(matches!(read, Err(ApiError::Forbidden(_))));
    let detail = conversation_detail(&state, eve, convo).await;
    assert!(matches!(detail, Err(ApiError::Forbidden(_))));

    let nowhere = send_message(&state, Uuid::new_v4(), a, text("hello?")).await;
    assert!(matches!(nowhere, Err(ApiError::NotFound(_))));
}

#[tokio::test]
async fn replies_and_attachments() {
    let state = state();
    let (a, b) = (user(&state, "An", "Tran"), user(&state, "Binh", "Le"));
    let convo = direct(&state, a, b).await;

    let question = send(&state, convo, b, text("lunch?")).await;
    let answer = send(
        &state,
        convo,
        a,
        SendMessageRequest {
            content: Some("yes".into()),
            reply_to_message_id: Some(question.id),
            ..Default::default()
        },
    )
    .await;
    let quoted = answer.reply_to.unwrap();
    assert_eq!(quoted.id, question.id);
    assert_eq!(quoted.sender_name, "Binh Le");
    assert_eq!(quoted.content.as_deref(), Some("lunch?"));

    let dangling = Uuid::new_v4();
    let orphan = send(
        &state,
        convo,
        a,
        SendMessageRequest {
            content: Some("about that".into()),
            reply_to_message_id: Some(dangling),
            ..Default::default()
        },
    )
    .await;
    assert!(orphan.reply_to.is_none());
    assert_eq!(orphan.reply_to_message_id, Some(dangling));

    let photo = send(
        &state,
        convo,
        a,
        SendMessageRequest {
            image_urls: Some(ImageInput::One("https://cdn.example/p.jpg".into())),
            ..Default::default()
        },
    )
    .await;
    assert_eq!(photo.kind, "image");
    assert_eq!(photo.image_urls, vec!["https://cdn.example/p.jpg"]);

    let summary = conversation_detail(&state, b, convo).await.unwrap();
    assert_eq!(summary.last_message, "[image]");

    let empty = send_message(&state, convo, a, text("   ")).await;
    assert!(matches!(empty, Err(ApiError::Validation(_))));
}

#[tokio::test]
async fn search_matches_names_and_last_message() {
    let state = state();
    let (a, b, c) = (
        user(&state, "An", "Tran"),
        user(&state, "Binh", "Le"),
        user(&state, "Chi", "Pham"),
    );
    let with_b = direct(&state, a, b).await;
    let with_c = direct(&state, a, c).await;
    send(&state, with_c, c, text("see you at 100% effort")).await;

    let search = |term: &str| PageQuery {
        search: Some(term.to_string()),
        ..Default::default()
    };

    let by_name = list_conversations(&state, a, &search("binh")).await.unwrap();
    assert_eq!(by_name.total, 1);
    assert_eq!(by_name.conversations[0].id, with_b);

    let by_content = list_conversations(&state, a, &search("100%")).await.unwrap();
    assert_eq!(by_content.total, 1);
    assert_eq!(by_content.conversations[0].id, with_c);

    // Most recently active first
    let all = list_conversations(&state, a, &PageQuery::default()).await.unwrap();
    assert_eq!(all.conversations[0].id, with_c);
}

#[tokio::test]
async fn notifications_reach_the_recipient_but_never_the_actor() {
    let state = state();
    let (owner, fan) = (user(&state, "An", "Tran"), user(&state, "Binh", "Le"));
    let mut client = Client::connect(&state, owner).await;

    notify_like(&state, "p1", owner, owner).await.unwrap();
    assert!(client.drain_messages().is_empty());

    notify_like(&state, "p1", fan, owner).await.unwrap();
    let events = client.drain_messages();
    assert_eq!(events.len(), 2);
    match &events[0] {
        ServerEvent::NewNotification(n) => {
            assert_eq!(n.kind, NotificationKind::Like);
            assert_eq!(n.sender.as_ref().unwrap().first_name.as_deref(), Some("Binh"));
            assert_eq!(n.related_id.as_deref(), Some("p1"));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(events[1], ServerEvent::NotificationUnreadTotalUpdated { total: 1 });

    notify_comment(&state, "p1", fan, owner, &"a".repeat(80)).await.unwrap();
    notify_follow(&state, fan, owner).await.unwrap();
    let feed = list_notifications(&state, owner, NotificationView::Feed, &PageQuery::default())
        .await
        .unwrap();
    assert_eq!(feed.total, 3);
    let comment = feed
        .notifications
        .iter()
        .find(|n| n.kind == NotificationKind::Comment)
        .unwrap();
    assert!(comment.content.ends_with("...\""));
}

#[tokio::test]
async fn admin_only_kinds_stay_out_of_the_feed() {
    let state = state();
    let root = admin(&state, "Root");
    let (author, reporter) = (user(&state, "An", "Tran"), user(&state, "Binh", "Le"));

    notify_post_submitted(&state, "p9", author, "my first post").await.unwrap();
    notify_report_to_admins(&state, "p9", reporter, author, "spam").await.unwrap();

    let admin_view = list_notifications(&state, root, NotificationView::Admin, &PageQuery::default())
        .await
        .unwrap();
    assert_eq!(admin_view.total, 2);
    assert!(admin_view.notifications.iter().all(|n| n.kind.is_admin_only()));
    let report = admin_view
        .notifications
        .iter()
        .find(|n| n.kind == NotificationKind::ReportNew)
        .unwrap();
    assert!(report.content.contains("An Tran") && report.content.contains("Binh Le"));

    let feed = list_notifications(&state, root, NotificationView::Feed, &PageQuery::default())
        .await
        .unwrap();
    assert_eq!(feed.total, 0);
    assert_eq!(unread_total(&state, root, NotificationView::Feed).await.unwrap(), 0);
    assert_eq!(unread_total(&state, root, NotificationView::Admin).await.unwrap(), 2);

    // The author gets a pending-review notice in their feed
    let author_feed = list_notifications(&state, author, NotificationView::Feed, &PageQuery::default())
        .await
        .unwrap();
    assert_eq!(author_feed.total, 1);
    assert_eq!(author_feed.notifications[0].kind, NotificationKind::System);
}

#[tokio::test]
async fn followers_hear_about_new_posts() {
    let state = state();
    let author = user(&state, "An", "Tran");
    let (f1, f2) = (user(&state, "Binh", "Le"), user(&state, "Chi", "Pham"));
    for follower in [f1, f2, author] {
        state.db.add_follower(&follower.to_string(), &author.to_string()).unwrap();
    }

    assert_eq!(notify_followers_of_new_post(&state, "p3", author).await.unwrap(), 2);
    for follower in [f1, f2] {
        let feed = list_notifications(&state, follower, NotificationView::Feed, &PageQuery::default())
            .await
            .unwrap();
        assert_eq!(feed.notifications[0].kind, NotificationKind::NewPost);
        assert!(feed.notifications[0].content.starts_with("An Tran"));
    }
    assert_eq!(unread_total(&state, author, NotificationView::Feed).await.unwrap(), 0);

    assert_eq!(notify_followers_of_new_post(&state, "p4", Uuid::new_v4()).await.unwrap(), 0);
}

#[tokio::test]
async fn read_state_changes_push_the_feed_total() {
    let state = state();
    let (owner, fan) = (user(&state, "An", "Tran"), user(&state, "Binh", "Le"));
    notify_like(&state, "p1", fan, owner).await.unwrap();
    notify_follow(&state, fan, owner).await.unwrap();
    notify_like(&state, "p2", fan, owner).await.unwrap();

    let mut client = Client::connect(&state, owner).await;
    let feed = list_notifications(&state, owner, NotificationView::Feed, &PageQuery::default())
        .await
        .unwrap();
    let ids: Vec<Uuid> = feed.notifications.iter().map(|n| n.id).collect();

    mark_read(&state, owner, ids[0]).await.unwrap();
    assert_eq!(client.drain_messages(), vec![ServerEvent::NotificationUnreadTotalUpdated { total: 2 }]);

    let not_mine = mark_read(&state, fan, ids[1]).await;
    assert!(matches!(not_mine, Err(ApiError::NotFound(_))));

    // Deleting an already-read notification does not change the total
    delete_one(&state, owner, ids[0]).await.unwrap();
    assert!(client.drain_messages().is_empty());
    delete_one(&state, owner, ids[1]).await.unwrap();
    assert_eq!(client.drain_messages(), vec![ServerEvent::NotificationUnreadTotalUpdated { total: 1 }]);
    assert!(matches!(delete_one(&state, owner, ids[1]).await, Err(ApiError::NotFound(_))));

    assert_eq!(mark_all_read(&state, owner).await.unwrap(), 1);
    assert_eq!(unread_total(&state, owner, NotificationView::Feed).await.unwrap(), 0);

    let paged = list_notifications(
        &state,
        owner,
        NotificationView::Feed,
        &PageQuery {
            limit: Some(1),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(paged.total, 1);
    assert!(!paged.has_more);
}

#[tokio::test]
async fn moderation_outcomes_land_in_the_feed() {
    let state = state();
    let root = admin(&state, "Root");
    let (author, reporter) = (user(&state, "An", "Tran"), user(&state, "Binh", "Le"));
    let mut author_client = Client::connect(&state, author).await;
    let mut reporter_client = Client::connect(&state, reporter).await;
    author_client.drain();

    notify_post_approved(&state, "p7", author).await.unwrap();
    notify_report_processed(&state, reporter, "r1", "p7", "resolved").await.unwrap();

    for (client, related_type, related_id) in [
        (&mut author_client, "post", "p7"),
        (&mut reporter_client, "report", "r1"),
    ] {
        let events = client.drain_messages();
        assert_eq!(events.len(), 2);
        match &events[0] {
            ServerEvent::NewNotification(n) => {
                assert_eq!(n.kind, NotificationKind::System);
                assert_eq!(n.related_type.as_deref(), Some(related_type));
                assert_eq!(n.related_id.as_deref(), Some(related_id));
                assert!(n.sender.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(events[1], ServerEvent::NotificationUnreadTotalUpdated { total: 1 });
    }

    for (user_id, related_type) in [(author, "post"), (reporter, "report")] {
        let system_tab = PageQuery {
            tab: Some("system".into()),
            ..Default::default()
        };
        let feed = list_notifications(&state, user_id, NotificationView::Feed, &system_tab)
            .await
            .unwrap();
        assert_eq!(feed.total, 1);
        assert_eq!(feed.notifications[0].related_type.as_deref(), Some(related_type));

        let admin_view = list_notifications(&state, user_id, NotificationView::Admin, &PageQuery::default())
            .await
            .unwrap();
        assert_eq!(admin_view.total, 0);
    }

    let report = list_notifications(&state, reporter, NotificationView::Feed, &PageQuery::default())
        .await
        .unwrap();
    assert!(report.notifications[0].content.contains("\"resolved\""));

    // Admins are not told about outcomes
    assert_eq!(unread_total(&state, root, NotificationView::Admin).await.unwrap(), 0);
}
