use chrono::NaiveDate;
use krg_evisit::config::SecurityConfig;
use krg_evisit::workflows::visit::{
    Clock, InMemoryStore, Notification, NotificationDispatcher, NotificationError, PermitCodec,
    SignatureService, VisitServices,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

/// Pending notifications held before `notify` starts refusing new ones.
pub(crate) const NOTIFICATION_QUEUE_DEPTH: usize = 1024;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

pub(crate) type ServiceStack = VisitServices<InMemoryStore, InMemoryStore, ChannelNotifier>;

/// Hands notifications to a background worker without blocking the caller.
#[derive(Clone)]
pub(crate) struct ChannelNotifier {
    sender: mpsc::Sender<Notification>,
}

impl ChannelNotifier {
    pub(crate) fn channel(depth: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (sender, receiver) = mpsc::channel(depth);
        (Self { sender }, receiver)
    }
}

impl NotificationDispatcher for ChannelNotifier {
    fn notify(&self, notification: Notification) -> Result<(), NotificationError> {
        self.sender.try_send(notification).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => {
                NotificationError::Transport("notification queue is full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                NotificationError::Transport("notification worker stopped".to_string())
            }
        })
    }
}

/// Drains the queue. SMS and e-mail gateways are not wired in, so delivery is logged.
pub(crate) fn spawn_notification_worker(
    mut receiver: mpsc::Receiver<Notification>,
) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut delivered = 0;
        while let Some(notification) = receiver.recv().await {
            info!(
                kind = ?notification.kind,
                reference = %notification.reference_number,
                email = notification.recipient_email.is_some(),
                "applicant notification dispatched"
            );
            delivered += 1;
        }
        delivered
    })
}

/// In-memory services wired to `notifier` and signing with the configured secret.
pub(crate) fn build_services(
    security: &SecurityConfig,
    notifier: ChannelNotifier,
    clock: Arc<dyn Clock>,
) -> (ServiceStack, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    let codec = PermitCodec::with_qr_renderer(SignatureService::new(security.permit_secret()));
    let services = VisitServices::new(store.clone(), Arc::new(notifier), codec, clock);
    (services, store)
}

pub(crate) fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|err| format!("failed to parse '{raw}' as YYYY-MM-DD ({err})"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use krg_evisit::config::AppEnvironment;
    use krg_evisit::workflows::visit::{
        ApplicationSubmission, NotificationKind, SystemClock,
    };

    fn submission() -> ApplicationSubmission {
        serde_json::from_value(serde_json::json!({
            "applicant": {
                "national_id": "N4400001",
                "full_name": "Dilan Omer",
                "phone_number": "+9647510000001",
                "date_of_birth": "1992-02-02",
                "nationality": "IQ"
            },
            "visit": {
                "origin_governorate": "Nineveh",
                "destination_governorate": "Duhok",
                "purpose": "BUSINESS",
                "start_date": "2026-11-01",
                "end_date": "2026-11-05"
            }
        }))
        .expect("submission json")
    }

    #[test]
    fn parse_date_reports_bad_input() {
        assert_eq!(
            parse_date(" 2026-10-17 "),
            Ok(NaiveDate::from_ymd_opt(2026, 10, 17).expect("valid"))
        );
        assert!(parse_date("17/10/2026").is_err());
    }

    #[test]
    fn full_queue_is_a_transport_error() {
        let (notifier, _receiver) = ChannelNotifier::channel(1);
        let security =
            SecurityConfig::from_secret(AppEnvironment::Test, None).expect("dev secret");
        let (services, _) = build_services(&security, notifier.clone(), Arc::new(SystemClock));
        let receipt = services
            .applications
            .submit(submission())
            .expect("submit fills the queue");

        let overflow = Notification::for_application(NotificationKind::Submitted, &receipt.application);
        assert!(matches!(
            notifier.notify(overflow),
            Err(NotificationError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn worker_drains_until_senders_drop() {
        let (notifier, receiver) = ChannelNotifier::channel(NOTIFICATION_QUEUE_DEPTH);
        let worker = spawn_notification_worker(receiver);
        let security =
            SecurityConfig::from_secret(AppEnvironment::Test, None).expect("dev secret");
        let (services, _) = build_services(&security, notifier, Arc::new(SystemClock));
        services
            .applications
            .submit(submission())
            .expect("submit");
        drop(services);

        assert_eq!(worker.await.expect("worker joins"), 1);
    }
}
