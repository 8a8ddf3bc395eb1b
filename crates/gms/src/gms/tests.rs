use std::collections::HashSet;
use std::pin::Pin;
use std::sync::atomic::AtomicUsize;

use async_trait::async_trait;
use futures::Stream;
use futures::channel::mpsc;
use pretty_assertions::assert_eq;
use tracing_test::traced_test;

use super::*;
use crate::builder::GmsBuilder;
use crate::messages::{JoinResult, MergeData, MergeId};
use crate::transport::NodeStatus;

fn addr(port: u16) -> Address {
    Address::localhost(port)
}

fn view_of(creator: u16, id: u64, ports: &[u16]) -> View {
    View::new(
        ViewId::new(addr(creator), id),
        Membership::from_members(ports.iter().map(|p| addr(*p))),
    )
}

/// Records outbound headers and loops headers addressed to itself back in
struct RecordingTransport {
    local: Address,
    sent: Mutex<Vec<(Address, GmsHeader)>>,
    discovery: Mutex<Vec<PingResponse>>,
    dead: Mutex<HashSet<Address>>,
    status_checks: Mutex<Vec<Address>>,
    status_delay: Mutex<Duration>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl RecordingTransport {
    fn new(local: Address) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded();
        Arc::new(Self {
            local,
            sent: Mutex::new(Vec::new()),
            discovery: Mutex::new(Vec::new()),
            dead: Mutex::new(HashSet::new()),
            status_checks: Mutex::new(Vec::new()),
            status_delay: Mutex::new(Duration::ZERO),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    fn inject(&self, src: Address, header: GmsHeader) {
        self.raise(TransportEvent::Message(GmsMessage { src, header }));
    }

    fn raise(&self, event: TransportEvent) {
        let _ = self.events_tx.unbounded_send(event);
    }

    fn kill(&self, node: Address) {
        self.dead.lock().insert(node);
    }

    fn sent_to(&self, dest: &Address) -> Vec<GmsHeader> {
        self.sent
            .lock()
            .iter()
            .filter(|(d, _)| d == dest)
            .map(|(_, h)| h.clone())
            .collect()
    }

    fn count_sent<F: Fn(&GmsHeader) -> bool>(&self, dest: &Address, filter: F) -> usize {
        self.sent_to(dest).iter().filter(|h| filter(*h)).count()
    }

    fn merge_requests(&self, dest: &Address) -> Vec<MergeId> {
        self.sent_to(dest)
            .into_iter()
            .filter_map(|h| match h {
                GmsHeader::MergeRequest { merge_id } => Some(merge_id),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl GmsTransport for RecordingTransport {
    async fn send(&self, dest: &Address, header: GmsHeader) -> GmsResult<()> {
        self.sent.lock().push((*dest, header.clone()));
        if *dest == self.local {
            self.inject(self.local, header);
        }
        Ok(())
    }

    async fn multicast(&self, dests: &[Address], header: GmsHeader) -> GmsResult<()> {
        for dest in dests {
            self.send(dest, header.clone()).await?;
        }
        Ok(())
    }

    async fn find_initial_members(&self) -> GmsResult<Vec<PingResponse>> {
        Ok(self.discovery.lock().clone())
    }

    async fn node_status(&self, node: &Address) -> NodeStatus {
        self.status_checks.lock().push(*node);
        let delay = *self.status_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.dead.lock().contains(node) {
            NodeStatus::Dead
        } else {
            NodeStatus::Alive
        }
    }

    async fn view_installed(&self, _view: &View) {}

    async fn disconnected(&self) {}

    fn incoming(&self) -> Pin<Box<dyn Stream<Item = TransportEvent> + Send>> {
        match self.events_rx.lock().take() {
            Some(rx) => Box::pin(rx),
            None => Box::pin(futures::stream::empty()),
        }
    }
}

#[derive(Default)]
struct TestApp {
    digest: Mutex<Option<Digest>>,
    views: Mutex<Vec<View>>,
    resets: Mutex<Vec<ViewId>>,
    excluded: AtomicBool,
    failing_distribution: AtomicBool,
    distribution_requests: AtomicUsize,
}

#[async_trait]
impl Application for TestApp {
    async fn on_view_changed(&self, view: View) {
        self.views.lock().push(view);
    }

    async fn get_digest(&self) -> GmsResult<Option<Digest>> {
        Ok(self.digest.lock().clone())
    }

    async fn set_digest(&self, digest: Digest) -> GmsResult<()> {
        *self.digest.lock() = Some(digest);
        Ok(())
    }

    async fn merge_digest(&self, digest: Digest) -> GmsResult<()> {
        let mut current = self.digest.lock();
        match current.as_mut() {
            Some(existing) => existing.merge(&digest),
            None => *current = Some(digest),
        }
        Ok(())
    }

    async fn get_hash_distribution(
        &self,
        _members: &[Address],
        _is_joining: bool,
        subgroup: &str,
    ) -> GmsResult<Option<HashDistribution>> {
        self.distribution_requests.fetch_add(1, Ordering::AcqRel);
        if self.failing_distribution.load(Ordering::Acquire) {
            return Err(GmsError::Application(format!("{subgroup} is rebalancing")));
        }
        Ok(None)
    }

    async fn reset_sequence(&self, view_id: &ViewId) {
        self.resets.lock().push(*view_id);
    }

    async fn on_excluded(&self, _view: &View) {
        self.excluded.store(true, Ordering::Release);
    }
}

type TestGms = Gms<RecordingTransport, TestApp>;

fn build_with(local: Address, config: GmsConfig) -> (TestGms, Arc<RecordingTransport>, Arc<TestApp>) {
    let transport = RecordingTransport::new(local);
    let app = Arc::new(TestApp::default());
    let gms = GmsBuilder::new(local)
        .with_config(config)
        .with_transport(transport.clone())
        .with_application(app.clone())
        .build()
        .unwrap();
    (gms, transport, app)
}

fn build(local: Address) -> (TestGms, Arc<RecordingTransport>, Arc<TestApp>) {
    build_with(local, GmsConfig::for_testing())
}

fn coordinator_of(gms: &TestGms) -> Arc<CoordinatorRole> {
    match &*gms.role() {
        Role::Coordinator(c) => c.clone(),
        other => panic!("expected coordinator, got {:?}", other),
    }
}

fn participant_of(gms: &TestGms) -> Arc<ParticipantRole> {
    match &*gms.role() {
        Role::Participant(p) => p.clone(),
        other => panic!("expected participant, got {:?}", other),
    }
}

fn is_view(header: &GmsHeader) -> bool {
    matches!(header, GmsHeader::View { .. })
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
#[traced_test]
async fn test_connect_without_peers_starts_singleton() {
    let (gms, _transport, app) = build(addr(7000));

    gms.connect().await.unwrap();

    assert!(gms.is_coordinator());
    assert!(gms.is_operational());
    assert_eq!(gms.view_id(), Some(ViewId::new(addr(7000), 0)));
    assert_eq!(gms.members().members(), &[addr(7000)]);
    assert_eq!(app.views.lock().len(), 1);
    assert!(app.digest.lock().as_ref().unwrap().contains(&addr(7000)));

    assert!(matches!(
        gms.connect().await,
        Err(GmsError::AlreadyConnected)
    ));
    gms.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_without_view() {
    let (gms, _transport, _app) = build(addr(7000));
    assert!(matches!(gms.disconnect().await, Err(GmsError::NotConnected)));
}

#[tokio::test]
async fn test_build_requires_transport() {
    let result = GmsBuilder::<RecordingTransport, TestApp>::new(addr(7000))
        .with_application(Arc::new(TestApp::default()))
        .build();
    assert!(matches!(result, Err(GmsError::Configuration(_))));
}

#[tokio::test]
async fn test_stale_views_are_discarded() {
    let (gms, transport, app) = build(addr(7001));

    let first = view_of(7000, 3, &[7000, 7001]);
    assert_eq!(
        gms.install_view(first, None, Some(addr(7000))).await,
        InstallOutcome::Installed
    );
    assert_eq!(gms.role_kind(), RoleKind::Participant);

    let older = view_of(7000, 2, &[7000, 7001, 7002]);
    assert_eq!(
        gms.install_view(older, None, Some(addr(7000))).await,
        InstallOutcome::Stale
    );
    let same = view_of(7000, 3, &[7000, 7001, 7002]);
    assert_eq!(
        gms.install_view(same, None, Some(addr(7000))).await,
        InstallOutcome::Stale
    );
    assert!(transport.sent_to(&addr(7000)).is_empty());
    assert_eq!(gms.view_id(), Some(ViewId::new(addr(7000), 3)));

    let mut forced = view_of(7000, 1, &[7000, 7001, 7002]);
    forced.force_install = true;
    assert_eq!(
        gms.install_view(forced, None, Some(addr(7000))).await,
        InstallOutcome::Installed
    );
    assert_eq!(gms.members().len(), 3);
    assert_eq!(app.views.lock().len(), 2);
}

#[tokio::test]
async fn test_same_members_only_advance_the_id() {
    let (gms, _transport, app) = build(addr(7001));
    gms.install_view(view_of(7000, 1, &[7000, 7001]), None, Some(addr(7000)))
        .await;

    assert_eq!(
        gms.install_view(view_of(7000, 4, &[7000, 7001]), None, Some(addr(7000)))
            .await,
        InstallOutcome::Unchanged
    );
    assert_eq!(gms.view_id(), Some(ViewId::new(addr(7000), 4)));
    assert_eq!(app.views.lock().len(), 1);
}

#[tokio::test]
async fn test_view_without_local_member_is_ignored() {
    let (gms, transport, app) = build(addr(7001));
    gms.install_view(view_of(7000, 1, &[7000, 7001]), None, Some(addr(7000)))
        .await;

    assert_eq!(
        gms.install_view(view_of(7000, 2, &[7000]), None, Some(addr(7000)))
            .await,
        InstallOutcome::NotIncluded
    );
    assert!(gms.is_operational());
    assert_eq!(gms.members().len(), 2);
    assert!(!app.excluded.load(Ordering::Acquire));
    assert_eq!(
        transport.sent_to(&addr(7000)),
        vec![GmsHeader::ViewRejected { member: addr(7001) }]
    );
}

#[tokio::test]
async fn test_view_for_others_is_not_answered_by_newcomer() {
    let (gms, transport, _app) = build(addr(7003));

    assert_eq!(
        gms.install_view(view_of(7000, 1, &[7000, 7001]), None, Some(addr(7000)))
            .await,
        InstallOutcome::NotIncluded
    );
    assert!(transport.sent_to(&addr(7000)).is_empty());
    assert!(!gms.is_operational());
}

#[tokio::test]
async fn test_exclusion_resets_when_configured() {
    let config = GmsConfig {
        leave_on_exclusion: true,
        ..GmsConfig::for_testing()
    };
    let (gms, _transport, app) = build_with(addr(7001), config);
    gms.install_view(view_of(7000, 1, &[7000, 7001]), None, Some(addr(7000)))
        .await;

    gms.install_view(view_of(7000, 2, &[7000]), None, Some(addr(7000)))
        .await;

    assert!(!gms.is_operational());
    assert_eq!(gms.role_kind(), RoleKind::Client);
    assert!(gms.members().is_empty());
    assert!(app.excluded.load(Ordering::Acquire));
}

#[tokio::test]
#[traced_test]
async fn test_rejects_view_while_coordinator_alive() {
    let (gms, transport, _app) = build(addr(7002));
    gms.install_view(view_of(7000, 1, &[7000, 7002]), None, Some(addr(7000)))
        .await;

    let rival = view_of(7001, 5, &[7001, 7002]);
    assert_eq!(
        gms.install_view(rival.clone(), None, Some(addr(7001))).await,
        InstallOutcome::Rejected
    );
    assert_eq!(
        transport.sent_to(&addr(7001)),
        vec![GmsHeader::ViewRejected { member: addr(7002) }]
    );
    assert_eq!(gms.coordinator(), Some(addr(7000)));

    transport.kill(addr(7000));
    assert_eq!(
        gms.install_view(rival, None, Some(addr(7001))).await,
        InstallOutcome::Installed
    );
    assert_eq!(gms.coordinator(), Some(addr(7001)));
}

#[tokio::test]
async fn test_accepts_new_coordinator_from_current_one() {
    let (gms, _transport, _app) = build(addr(7002));
    gms.install_view(view_of(7001, 1, &[7001, 7002]), None, Some(addr(7001)))
        .await;

    // merged view created by 7000, fanned out by our own coordinator
    let merged = view_of(7000, 4, &[7000, 7001, 7002]);
    assert_eq!(
        gms.install_view(merged, None, Some(addr(7001))).await,
        InstallOutcome::Installed
    );
    assert_eq!(gms.coordinator(), Some(addr(7000)));
    assert_eq!(gms.role_kind(), RoleKind::Participant);
}

#[tokio::test]
async fn test_install_switches_roles() {
    let (gms, _transport, _app) = build(addr(7001));
    gms.install_view(view_of(7000, 1, &[7000, 7001]), None, Some(addr(7000)))
        .await;
    assert_eq!(gms.role_kind(), RoleKind::Participant);

    gms.install_view(view_of(7000, 2, &[7001, 7002]), None, Some(addr(7000)))
        .await;
    assert_eq!(gms.role_kind(), RoleKind::Coordinator);
}

#[tokio::test]
async fn test_next_view_builds_on_pending_changes() {
    let (gms, _transport, _app) = build(addr(7000));
    assert!(gms.get_next_view(&[addr(7001)], &[], &[]).is_none());

    gms.connect().await.unwrap();

    let first = gms.get_next_view(&[addr(7001)], &[], &[]).unwrap();
    assert_eq!(*first.vid(), ViewId::new(addr(7000), 1));
    assert_eq!(first.members().members(), &[addr(7000), addr(7001)]);

    let second = gms.get_next_view(&[addr(7002)], &[], &[]).unwrap();
    assert_eq!(second.vid().id(), 2);
    assert_eq!(
        second.members().members(),
        &[addr(7000), addr(7001), addr(7002)]
    );

    let third = gms.get_next_view(&[], &[], &[addr(7001)]).unwrap();
    assert_eq!(third.vid().id(), 3);
    assert_eq!(third.members().members(), &[addr(7000), addr(7002)]);
    gms.shutdown().await;
}

#[tokio::test]
async fn test_join_of_self_is_rejected() {
    let (gms, _transport, _app) = build(addr(7000));
    gms.connect().await.unwrap();

    let coordinator = coordinator_of(&gms);
    let decision = coordinator
        .handle_join(&gms, addr(7000), "default", gms.incarnation())
        .await;
    match decision {
        Some(JoinDecision::Reply(rsp)) => assert_eq!(rsp.result, JoinResult::Rejected),
        _ => panic!("expected rejection"),
    }
    gms.shutdown().await;
}

#[tokio::test]
async fn test_repeated_join_gets_same_response() {
    let (gms, _transport, _app) = build(addr(7000));
    gms.connect().await.unwrap();
    let coordinator = coordinator_of(&gms);
    let incarnation = Uuid::new_v4();

    let Some(JoinDecision::Admitted(rsp)) = coordinator
        .handle_join(&gms, addr(7001), "default", incarnation)
        .await
    else {
        panic!("expected admission");
    };
    let digest = rsp.digest.clone().unwrap();
    assert_eq!(digest.len(), 2);
    assert_eq!(digest.high_seqno_at(&addr(7001)), 0);

    coordinator.remember_admission(addr(7001), incarnation, rsp.clone());
    let view = rsp.view.clone().unwrap();
    assert_eq!(
        gms.install_view(view, None, Some(addr(7000))).await,
        InstallOutcome::Installed
    );

    let Some(JoinDecision::Reply(again)) = coordinator
        .handle_join(&gms, addr(7001), "default", incarnation)
        .await
    else {
        panic!("expected a cached reply");
    };
    assert_eq!(again, rsp);
    gms.shutdown().await;
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_join_request_is_admitted_and_broadcast() {
    let (gms, transport, _app) = build(addr(7000));
    gms.connect().await.unwrap();

    transport.inject(
        addr(7001),
        GmsHeader::JoinRequest {
            member: addr(7001),
            subgroup: "default".to_string(),
            incarnation: Uuid::new_v4(),
        },
    );

    wait_for(|| gms.members().len() == 2).await;
    assert_eq!(gms.members().members(), &[addr(7000), addr(7001)]);

    let to_joiner = transport.sent_to(&addr(7001));
    match &to_joiner[0] {
        GmsHeader::JoinResponse(rsp) => {
            assert_eq!(rsp.result, JoinResult::Success);
            assert!(rsp.view.as_ref().unwrap().contains(&addr(7001)));
        }
        other => panic!("expected join response, got {}", other),
    }
    assert!(
        to_joiner
            .iter()
            .any(|h| matches!(h, GmsHeader::View { view, .. } if view.contains(&addr(7001))))
    );
    gms.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_rejoin_with_new_incarnation_evicts_old() {
    let (gms, transport, _app) = build(addr(7000));
    gms.connect().await.unwrap();

    let join = |incarnation| GmsHeader::JoinRequest {
        member: addr(7001),
        subgroup: "default".to_string(),
        incarnation,
    };
    transport.inject(addr(7001), join(Uuid::new_v4()));
    wait_for(|| gms.members().len() == 2).await;

    // wait for the join task to finish its broadcast
    wait_for(|| !gms.inner.change_guard.lock().join_in_progress).await;

    transport.inject(addr(7001), join(Uuid::new_v4()));
    wait_for(|| gms.members().len() == 1).await;

    let responses: Vec<JoinResult> = transport
        .sent_to(&addr(7001))
        .into_iter()
        .filter_map(|h| match h {
            GmsHeader::JoinResponse(rsp) => Some(rsp.result),
            _ => None,
        })
        .collect();
    assert_eq!(
        responses,
        vec![JoinResult::Success, JoinResult::ChangeInProgress]
    );
    gms.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_coordinator_leave_hands_over() {
    let (gms, transport, _app) = build(addr(7000));
    gms.connect().await.unwrap();
    let coordinator = coordinator_of(&gms);
    let Some(JoinDecision::Admitted(rsp)) = coordinator
        .handle_join(&gms, addr(7001), "default", Uuid::new_v4())
        .await
    else {
        panic!("expected admission");
    };
    gms.install_view(rsp.view.unwrap(), None, Some(addr(7000)))
        .await;

    gms.disconnect().await.unwrap();

    assert_eq!(gms.role_kind(), RoleKind::Client);
    assert!(!gms.is_operational());
    assert!(transport.sent_to(&addr(7001)).iter().any(|h| matches!(
        h,
        GmsHeader::View { view, .. } if view.members().members() == [addr(7001)]
    )));
}

#[tokio::test]
async fn test_reset_on_rejoin_only_moves_forward() {
    let (gms, _transport, app) = build(addr(7001));
    gms.install_view(view_of(7000, 3, &[7000, 7001]), None, Some(addr(7000)))
        .await;

    gms.handle_reset_on_node_rejoining(addr(7000), addr(7001), view_of(7000, 2, &[7000, 7001]))
        .await;
    assert!(app.resets.lock().is_empty());

    let newer = view_of(7000, 4, &[7000, 7001]);
    gms.handle_reset_on_node_rejoining(addr(7000), addr(7001), newer)
        .await;
    assert_eq!(*app.resets.lock(), vec![ViewId::new(addr(7000), 4)]);
    assert_eq!(gms.view_id(), Some(ViewId::new(addr(7000), 4)));
}

#[tokio::test]
async fn test_state_transfer_marks() {
    let (gms, _transport, _app) = build(addr(7000));
    assert!(!gms.is_in_state_transfer());

    gms.mark_state_transfer_in_process();
    assert!(gms.is_in_state_transfer());
    assert!(gms.is_cluster_in_state_transfer().await);

    gms.mark_state_transfer_completed();
    assert!(!gms.is_in_state_transfer());
    assert!(!gms.is_cluster_in_state_transfer().await);
}

#[tokio::test]
async fn test_ping_response_reflects_membership() {
    let (gms, _transport, _app) = build(addr(7001));
    assert_eq!(gms.ping_response(), PingResponse::joining(addr(7001)));

    gms.install_view(view_of(7000, 1, &[7000, 7001]), None, Some(addr(7000)))
        .await;
    assert_eq!(
        gms.ping_response(),
        PingResponse::joined(addr(7001), addr(7000))
    );
}

#[tokio::test]
async fn test_stale_view_from_foreign_coordinator_is_answered() {
    let (gms, transport, _app) = build(addr(7002));
    gms.install_view(view_of(7000, 5, &[7000, 7002]), None, Some(addr(7000)))
        .await;

    // retransmission from our own coordinator
    assert_eq!(
        gms.install_view(view_of(7000, 5, &[7000, 7002]), None, Some(addr(7000)))
            .await,
        InstallOutcome::Stale
    );
    assert!(transport.sent_to(&addr(7000)).is_empty());

    assert_eq!(
        gms.install_view(view_of(7001, 3, &[7001, 7002]), None, Some(addr(7001)))
            .await,
        InstallOutcome::Stale
    );
    assert_eq!(
        transport.sent_to(&addr(7001)),
        vec![GmsHeader::ViewRejected { member: addr(7002) }]
    );
    assert_eq!(gms.view_id(), Some(ViewId::new(addr(7000), 5)));
}

#[tokio::test]
async fn test_coordinator_ignores_rejection_from_non_member() {
    let (gms, transport, _app) = build(addr(7000));
    gms.connect().await.unwrap();
    let coordinator = coordinator_of(&gms);

    coordinator.handle_view_rejected(&gms, addr(7005)).await;

    assert!(transport.sent_to(&addr(7005)).is_empty());
    assert_eq!(gms.view_id(), Some(ViewId::new(addr(7000), 0)));
    gms.shutdown().await;
}

#[tokio::test]
async fn test_next_view_is_sorted_by_address() {
    let (gms, _transport, _app) = build(addr(7001));
    gms.connect().await.unwrap();

    let first = gms.get_next_view(&[addr(7003)], &[], &[]).unwrap();
    assert_eq!(first.members().members(), &[addr(7001), addr(7003)]);
    assert_eq!(first.coordinator_incarnation, Some(gms.incarnation()));

    let second = gms.get_next_view(&[addr(7000)], &[], &[]).unwrap();
    assert_eq!(
        second.members().members(),
        &[addr(7000), addr(7001), addr(7003)]
    );
    assert_eq!(second.coordinator(), Some(&addr(7000)));
    assert_eq!(*second.creator(), addr(7001));
    gms.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_lower_joiner_takes_over_coordination() {
    let (gms, transport, _app) = build(addr(7001));
    gms.connect().await.unwrap();

    transport.inject(
        addr(7000),
        GmsHeader::JoinRequest {
            member: addr(7000),
            subgroup: "default".to_string(),
            incarnation: Uuid::new_v4(),
        },
    );

    wait_for(|| gms.members().len() == 2).await;
    assert_eq!(gms.members().members(), &[addr(7000), addr(7001)]);
    assert_eq!(gms.coordinator(), Some(addr(7000)));
    assert_eq!(gms.role_kind(), RoleKind::Participant);
    gms.shutdown().await;
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_broadcast_is_repeated_once_without_acks() {
    let (gms, transport, _app) = build(addr(7000));
    gms.connect().await.unwrap();

    let view = view_of(7000, 1, &[7000, 7001]);
    let acknowledged = gms
        .broadcast_view(view, None, Some(vec![addr(7001)]))
        .await;

    assert!(!acknowledged);
    assert_eq!(transport.count_sent(&addr(7001), is_view), 2);
    assert!(gms.inner.view_acks.is_empty());
    gms.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_completes_when_all_acknowledge() {
    let (gms, transport, _app) = build(addr(7000));
    gms.connect().await.unwrap();

    let view = view_of(7000, 1, &[7000, 7001, 7002]);
    let view_id = *view.vid();
    let broadcaster = gms.clone();
    let broadcast = tokio::spawn(async move {
        broadcaster
            .broadcast_view(view, None, Some(vec![addr(7001), addr(7002)]))
            .await
    });

    wait_for(|| transport.count_sent(&addr(7002), is_view) == 1).await;
    transport.inject(addr(7001), GmsHeader::ViewAck { view_id });
    // acks for other views do not count
    transport.inject(
        addr(7002),
        GmsHeader::ViewAck {
            view_id: ViewId::new(addr(7000), 9),
        },
    );
    transport.inject(addr(7002), GmsHeader::ViewAck { view_id });

    assert!(broadcast.await.unwrap());
    assert_eq!(transport.count_sent(&addr(7001), is_view), 1);
    gms.shutdown().await;
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_merge_leaves_out_rejecting_coordinators() {
    let (gms, transport, _app) = build(addr(7000));
    gms.connect().await.unwrap();
    let coordinator = coordinator_of(&gms);

    coordinator.merge(&gms, vec![addr(7002), addr(7000), addr(7001)]);
    assert!(coordinator.is_merging());

    wait_for(|| !transport.merge_requests(&addr(7002)).is_empty()).await;
    let merge_id = transport.merge_requests(&addr(7001))[0];
    transport.inject(
        addr(7001),
        GmsHeader::MergeResponse {
            merge_id,
            data: MergeData::rejected(addr(7001)),
        },
    );
    let mut digest = Digest::new(2);
    digest.add(addr(7002), 0, 4);
    digest.add(addr(7003), 0, 1);
    transport.inject(
        addr(7002),
        GmsHeader::MergeResponse {
            merge_id,
            data: MergeData::new(addr(7002), view_of(7002, 6, &[7002, 7003]), digest),
        },
    );

    wait_for(|| gms.members().len() == 3).await;
    assert_eq!(
        gms.members().members(),
        &[addr(7000), addr(7002), addr(7003)]
    );
    assert_eq!(gms.view_id(), Some(ViewId::new(addr(7000), 7)));
    assert!(gms.view().unwrap().is_merge_view());

    let installs = |dest: Address| {
        transport.count_sent(&dest, |h| matches!(h, GmsHeader::InstallMergeView { .. }))
    };
    assert_eq!(installs(addr(7002)), 1);
    assert_eq!(installs(addr(7001)), 0);
    wait_for(|| !coordinator.is_merging()).await;
    gms.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_merge_with_one_usable_response_is_cancelled() {
    let (gms, transport, _app) = build(addr(7000));
    gms.connect().await.unwrap();
    let coordinator = coordinator_of(&gms);

    coordinator.merge(&gms, vec![addr(7000), addr(7001)]);
    wait_for(|| !transport.merge_requests(&addr(7001)).is_empty()).await;
    let merge_id = transport.merge_requests(&addr(7001))[0];
    transport.inject(
        addr(7001),
        GmsHeader::MergeResponse {
            merge_id,
            data: MergeData::rejected(addr(7001)),
        },
    );

    wait_for(|| !coordinator.is_merging()).await;
    assert_eq!(
        transport.sent_to(&addr(7001)),
        vec![
            GmsHeader::MergeRequest { merge_id },
            GmsHeader::CancelMerge { merge_id },
        ]
    );
    assert_eq!(gms.members().members(), &[addr(7000)]);
    gms.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stopped_merge_is_cancelled_at_once() {
    let (gms, transport, _app) = build(addr(7000));
    gms.connect().await.unwrap();
    let coordinator = coordinator_of(&gms);
    let started = tokio::time::Instant::now();

    coordinator.merge(&gms, vec![addr(7000), addr(7001), addr(7002)]);
    wait_for(|| !transport.merge_requests(&addr(7002)).is_empty()).await;
    coordinator.stop();

    let cancelled = |dest: Address| {
        transport.count_sent(&dest, |h| matches!(h, GmsHeader::CancelMerge { .. }))
    };
    wait_for(|| cancelled(addr(7001)) == 1 && cancelled(addr(7002)) == 1).await;
    assert!(started.elapsed() < gms.config().merge_timeout);
    wait_for(|| !coordinator.is_merging()).await;
    gms.shutdown().await;
}

#[tokio::test]
async fn test_merge_request_refused_while_merging() {
    let (gms, transport, _app) = build(addr(7001));
    gms.connect().await.unwrap();
    let coordinator = coordinator_of(&gms);

    let first = MergeId::new(addr(7000));
    coordinator.handle_merge_request(&gms, addr(7000), first).await;
    assert!(coordinator.is_merging());

    let second = MergeId::new(addr(7002));
    coordinator.handle_merge_request(&gms, addr(7002), second).await;

    match transport.sent_to(&addr(7000)).as_slice() {
        [GmsHeader::MergeResponse { merge_id, data }] => {
            assert_eq!(*merge_id, first);
            assert!(!data.rejected);
            assert_eq!(data.view.as_ref().map(|v| *v.vid()), gms.view_id());
        }
        other => panic!("unexpected headers {:?}", other),
    }
    assert_eq!(
        transport.sent_to(&addr(7002)),
        vec![GmsHeader::MergeResponse {
            merge_id: second,
            data: MergeData::rejected(addr(7001)),
        }]
    );

    coordinator.handle_merge_cancelled(second);
    assert!(coordinator.is_merging());
    coordinator.handle_merge_cancelled(first);
    assert!(!coordinator.is_merging());
    gms.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_merge_is_cleared_by_watchdog() {
    let (gms, _transport, _app) = build(addr(7001));
    gms.connect().await.unwrap();
    let coordinator = coordinator_of(&gms);
    let merge_timeout = gms.config().merge_timeout;

    coordinator
        .handle_merge_request(&gms, addr(7000), MergeId::new(addr(7000)))
        .await;

    tokio::time::sleep(merge_timeout).await;
    assert!(coordinator.is_merging());

    tokio::time::sleep(merge_timeout + Duration::from_millis(10)).await;
    assert!(!coordinator.is_merging());
    gms.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_death_reports_are_verified_one_at_a_time() {
    let (gms, transport, _app) = build(addr(7002));
    gms.install_view(view_of(7000, 1, &[7000, 7001, 7002]), None, Some(addr(7000)))
        .await;
    let participant = participant_of(&gms);
    *transport.status_delay.lock() = Duration::from_millis(100);

    tokio::join!(
        participant.handle_inform_about_node_death(&gms, addr(7003), addr(7000)),
        participant.handle_inform_about_node_death(&gms, addr(7004), addr(7000)),
    );
    assert_eq!(*transport.status_checks.lock(), vec![addr(7000)]);
    assert!(transport.sent_to(&addr(7001)).is_empty());

    transport.kill(addr(7000));
    participant
        .handle_inform_about_node_death(&gms, addr(7003), addr(7000))
        .await;

    assert_eq!(
        *transport.status_checks.lock(),
        vec![addr(7000), addr(7000), addr(7001)]
    );
    assert_eq!(
        transport.sent_to(&addr(7001)),
        vec![GmsHeader::ConnectionBroken {
            suspected: addr(7000)
        }]
    );
    assert_eq!(participant.suspected(), vec![addr(7000)]);
}

#[tokio::test(start_paused = true)]
async fn test_suspect_evicted_by_next_in_line() {
    let (gms, transport, _app) = build(addr(7001));
    gms.start().unwrap();
    gms.install_view(view_of(7000, 1, &[7000, 7001, 7002]), None, Some(addr(7000)))
        .await;
    let participant = participant_of(&gms);

    participant.handle_suspect(&gms, addr(7000)).await;

    assert_eq!(gms.role_kind(), RoleKind::Coordinator);
    assert_eq!(gms.members().members(), &[addr(7001), addr(7002)]);
    assert!(transport.sent_to(&addr(7002)).iter().any(|h| matches!(
        h,
        GmsHeader::View { view, .. } if view.members().members() == [addr(7001), addr(7002)]
    )));
    assert!(transport.sent_to(&addr(7000)).is_empty());
    gms.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_broken_connection_is_reported_to_coordinator() {
    let (gms, transport, _app) = build(addr(7002));
    gms.start().unwrap();
    gms.install_view(view_of(7000, 1, &[7000, 7001, 7002]), None, Some(addr(7000)))
        .await;

    transport.raise(TransportEvent::ConnectionBroken(addr(7001)));
    transport.raise(TransportEvent::ConnectionFailure(vec![addr(7001)]));

    wait_for(|| transport.sent_to(&addr(7000)).len() == 2).await;
    let reports = transport.sent_to(&addr(7000));
    assert!(reports.contains(&GmsHeader::ConnectionBroken {
        suspected: addr(7001)
    }));
    assert!(reports.contains(&GmsHeader::CanNotConnectTo {
        nodes: vec![addr(7001)]
    }));
    gms.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_hash_distribution_gives_up_after_bounded_attempts() {
    let (gms, _transport, app) = build(addr(7000));
    app.failing_distribution.store(true, Ordering::Release);

    let distribution = gms
        .acquire_hash_distribution(&[addr(7000), addr(7001)], true, "default")
        .await;

    assert!(distribution.is_none());
    assert_eq!(
        app.distribution_requests.load(Ordering::Acquire),
        gms.config().hash_distribution_attempts as usize
    );
}

#[tokio::test(start_paused = true)]
async fn test_bounded_wait_reports_timeout() {
    let result: GmsResult<()> = within(
        "digest fetch",
        Duration::from_millis(50),
        futures::future::pending(),
    )
    .await;

    let err = result.unwrap_err();
    assert!(err.is_transient());
    assert!(matches!(
        err,
        GmsError::Timeout {
            operation: "digest fetch",
            ..
        }
    ));
}

#[tokio::test]
async fn test_installed_view_marks_state_transfer() {
    let (gms, _transport, _app) = build(addr(7001));
    assert!(!gms.is_in_state_transfer());

    gms.install_view(view_of(7000, 1, &[7000, 7001]), None, Some(addr(7000)))
        .await;
    assert!(gms.is_in_state_transfer());

    gms.mark_state_transfer_completed();
    assert!(!gms.is_in_state_transfer());
}
