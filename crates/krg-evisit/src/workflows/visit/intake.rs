use super::domain::{ApplicantIdentity, ApplicationSubmission, VisitDetails};

/// Validation errors raised before a submission reaches storage.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IntakeViolation {
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("email address {0:?} is not valid")]
    InvalidEmail(String),
    #[error("visit ends before it starts")]
    VisitEndsBeforeStart,
    #[error("date of birth must precede the visit start date")]
    BirthDateAfterVisit,
}

impl IntakeViolation {
    pub fn code(&self) -> &'static str {
        "VALIDATION"
    }
}

fn required(value: String, field: &'static str) -> Result<String, IntakeViolation> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(IntakeViolation::MissingField(field));
    }
    Ok(trimmed.to_string())
}

/// Normalizes inbound submissions and rejects incomplete ones.
#[derive(Debug, Clone, Default)]
pub struct IntakeGuard;

impl IntakeGuard {
    pub fn new() -> Self {
        Self
    }

    /// Trimmed, validated copy of `submission`; e-mail is lower-cased.
    pub fn validate(
        &self,
        submission: ApplicationSubmission,
    ) -> Result<ApplicationSubmission, IntakeViolation> {
        let ApplicationSubmission { applicant, visit } = submission;

        let email = match applicant.email.map(|email| email.trim().to_ascii_lowercase()) {
            Some(email) if email.is_empty() => None,
            Some(email) => {
                let valid = email
                    .split_once('@')
                    .is_some_and(|(local, domain)| !local.is_empty() && !domain.is_empty());
                if !valid {
                    return Err(IntakeViolation::InvalidEmail(email));
                }
                Some(email)
            }
            None => None,
        };

        let applicant = ApplicantIdentity {
            national_id: required(applicant.national_id, "national_id")?,
            full_name: required(applicant.full_name, "full_name")?,
            phone_number: required(applicant.phone_number, "phone_number")?,
            email,
            date_of_birth: applicant.date_of_birth,
            nationality: required(applicant.nationality, "nationality")?,
        };

        let visit = VisitDetails {
            origin_governorate: required(visit.origin_governorate, "origin_governorate")?,
            destination_governorate: required(
                visit.destination_governorate,
                "destination_governorate",
            )?,
            purpose: visit.purpose,
            start_date: visit.start_date,
            end_date: visit.end_date,
            declared_accommodation: visit
                .declared_accommodation
                .map(|text| text.trim().to_string())
                .filter(|text| !text.is_empty()),
        };

        if visit.end_date < visit.start_date {
            return Err(IntakeViolation::VisitEndsBeforeStart);
        }
        if applicant.date_of_birth >= visit.start_date {
            return Err(IntakeViolation::BirthDateAfterVisit);
        }

        Ok(ApplicationSubmission { applicant, visit })
    }
}
