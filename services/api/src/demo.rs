use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use clap::Args;
use krg_evisit::config::AppConfig;
use krg_evisit::error::AppError;
use krg_evisit::workflows::visit::{
    Actor, ApplicantIdentity, ApplicationId, ApplicationSubmission, ApprovalInput,
    CheckpointAction, CheckpointRequest, Clock, InMemoryStore, ManualClock, NewWatchlistEntry,
    Notification, NotificationDispatcher, NotificationError, PermitCodec, ReviewInput, Role,
    ScreeningRequest, Severity, SignatureService, VisitDetails, VisitPurpose, VisitServices,
    WatchlistFlagType,
};
use std::sync::Arc;

#[derive(Args, Debug, Default)]
pub(crate) struct DemoArgs {
    /// Day the walkthrough starts on (YYYY-MM-DD). Defaults to today.
    #[arg(long, value_parser = crate::infra::parse_date)]
    pub(crate) today: Option<NaiveDate>,
    /// Permit validity in days.
    #[arg(long, default_value_t = 30)]
    pub(crate) validity_days: i64,
}

#[derive(Args, Debug)]
pub(crate) struct VerifyPermitArgs {
    /// Raw QR payload as scanned
    #[arg(long)]
    pub(crate) payload: String,
    /// Verification instant (RFC 3339). Defaults to now.
    #[arg(long)]
    pub(crate) at: Option<DateTime<Utc>>,
}

/// Prints notifications instead of sending them.
struct ConsoleNotifier;

impl NotificationDispatcher for ConsoleNotifier {
    fn notify(&self, notification: Notification) -> Result<(), NotificationError> {
        println!(
            "  [notify] {:?} -> {}",
            notification.kind, notification.reference_number
        );
        Ok(())
    }
}

type DemoServices = VisitServices<InMemoryStore, InMemoryStore, ConsoleNotifier>;

pub(crate) fn run_verify_permit(args: VerifyPermitArgs) -> Result<(), AppError> {
    let config = AppConfig::load()?;
    let codec = PermitCodec::with_qr_renderer(SignatureService::new(
        config.security.permit_secret(),
    ));
    let at = args.at.unwrap_or_else(Utc::now);
    match codec.parse_and_verify(&args.payload, at) {
        Ok(application_id) => println!("Permit valid for application {application_id}"),
        Err(err) => println!("Permit rejected: {} ({})", err.code(), err),
    }
    Ok(())
}

pub(crate) fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let config = AppConfig::load()?;
    let today = args.today.unwrap_or_else(|| Utc::now().date_naive());
    let start = Utc.from_utc_datetime(&today.and_hms_opt(9, 0, 0).unwrap_or_default());
    let clock = Arc::new(ManualClock::new(start));
    let shared: Arc<dyn Clock> = clock.clone();
    let store = Arc::new(InMemoryStore::new());
    let codec = PermitCodec::with_qr_renderer(SignatureService::new(
        config.security.permit_secret(),
    ));
    let services: DemoServices =
        VisitServices::new(store, Arc::new(ConsoleNotifier), codec, shared);

    let supervisor = Actor::new("supervisor-demo", Role::Supervisor);
    let officer = Actor::new("officer-demo", Role::Officer);
    let director = Actor::new("director-demo", Role::Director);
    let gate = Actor::new("gate-demo", Role::CheckpointOfficer);

    println!("Visitor e-permit walkthrough starting {today}");

    println!("\n1. Clean application");
    let receipt = services
        .applications
        .submit(demo_submission("D0000001", "+9647500009001", today))?;
    let id = receipt.application.id.clone();
    println!(
        "- {} submitted: risk {} ({}), priority {:?}",
        receipt.application.reference_number,
        receipt.assessment.risk_score,
        receipt.assessment.severity,
        receipt.application.priority
    );
    services.applications.assign(&supervisor, &id, &officer.id)?;
    services.applications.review(
        &officer,
        &id,
        ReviewInput {
            notes: "Identity and sponsor letter verified".to_string(),
            recommendation: Some("approve".to_string()),
        },
    )?;
    let valid_until = today + Duration::days(args.validity_days.max(0));
    let approval = services.applications.approve(
        &director,
        &id,
        ApprovalInput {
            valid_from: today,
            valid_until,
            notes: None,
        },
    )?;
    println!(
        "- Approved {today} to {valid_until}; QR image {} bytes",
        approval.permit.image.bytes.len()
    );

    match services.checkpoint.verify(
        &gate,
        CheckpointRequest {
            qr_payload: approval.permit.raw.clone(),
            action: CheckpointAction::Entry,
            checkpoint_id: "CP-DEMO".to_string(),
        },
    ) {
        Ok(pass) => println!("- {} ({:?})", pass.message, pass.visitor.status),
        Err(err) => println!("- Entry refused: {} ({})", err, err.code()),
    }

    println!("\n2. Repeat application by the same visitor");
    let repeat = services
        .applications
        .submit(demo_submission("D0000001", "+9647500009001", today))?;
    println!(
        "- {} risk {} ({}), manual review {}",
        repeat.application.reference_number,
        repeat.assessment.risk_score,
        repeat.assessment.severity,
        repeat.assessment.requires_manual_review
    );
    for flag in &repeat.assessment.flags {
        println!("  {}", flag.detail);
    }

    println!("\n3. Watchlisted identity");
    let watchlisted = services.watchlist.add(
        &supervisor,
        NewWatchlistEntry {
            national_id: "D0000099".to_string(),
            full_name: "Demo Subject".to_string(),
            phone_number: None,
            email: None,
            reason: "Interpol notice".to_string(),
            flag_type: WatchlistFlagType::SecurityConcern,
            severity: Severity::Critical,
            expires_at: None,
        },
    );
    if let Err(err) = watchlisted {
        println!("- Watchlist unavailable: {err}");
    }
    let assessment = services.applications.screen(
        &officer,
        &ScreeningRequest {
            national_id: "D0000099".to_string(),
            phone_number: "+9647500009099".to_string(),
            full_name: "Demo Subject".to_string(),
            exclude: None,
        },
    )?;
    println!("- {}", assessment.summary());

    println!("\n4. Tampered QR at the checkpoint");
    let tampered = approval
        .permit
        .raw
        .replace(id.as_str(), ApplicationId::generate().as_str());
    match services.checkpoint.verify(
        &gate,
        CheckpointRequest {
            qr_payload: tampered,
            action: CheckpointAction::Exit,
            checkpoint_id: "CP-DEMO".to_string(),
        },
    ) {
        Ok(_) => println!("- Tampered permit accepted (unexpected)"),
        Err(err) => println!("- Refused: {}", err.code()),
    }

    println!("\n5. Overstay sweep");
    let sweep_at = start + Duration::days(args.validity_days.max(0) + 12);
    clock.set(sweep_at);
    let report = services.applications.detect_and_flag_overstays()?;
    println!(
        "- Sweep at {}: examined {}, flagged {}",
        sweep_at.date_naive(),
        report.examined,
        report.flagged.len()
    );
    for finding in &report.flagged {
        let watchlist = finding
            .watchlist_severity
            .map(|severity| severity.to_string())
            .unwrap_or_else(|| "none".to_string());
        println!(
            "  {} overstayed {} days; watchlist {}",
            finding.reference_number, finding.overstay_days, watchlist
        );
    }

    Ok(())
}

fn demo_submission(national_id: &str, phone_number: &str, today: NaiveDate) -> ApplicationSubmission {
    ApplicationSubmission {
        applicant: ApplicantIdentity {
            national_id: national_id.to_string(),
            full_name: "Demo Visitor".to_string(),
            phone_number: phone_number.to_string(),
            email: Some("visitor@example.org".to_string()),
            date_of_birth: NaiveDate::from_ymd_opt(1988, 6, 1).unwrap_or(today),
            nationality: "IQ".to_string(),
        },
        visit: VisitDetails {
            origin_governorate: "Baghdad".to_string(),
            destination_governorate: "Erbil".to_string(),
            purpose: VisitPurpose::Business,
            start_date: today,
            end_date: today + Duration::days(10),
            declared_accommodation: Some("Hotel, Erbil".to_string()),
        },
    }
}
