use dashmap::DashMap;
use ulid::Ulid;

use crate::limits::MAX_CONTACT_LEN;
use crate::model::Customer;

use super::EngineError;
use super::conflict::validate_name;

/// Contact fields carried by a booking request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomerDetails {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Lowercased, trimmed; `None` when blank.
pub fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_lowercase();
    (!email.is_empty()).then_some(email)
}

/// Digits only, keeping a leading `+`; `None` when no digit is left.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    Some(if trimmed.starts_with('+') { format!("+{digits}") } else { digits })
}

/// All known customers plus lookup indexes on normalised contact fields.
#[derive(Debug, Default)]
pub struct CustomerBook {
    by_id: DashMap<Ulid, Customer>,
    by_email: DashMap<String, Ulid>,
    by_phone: DashMap<String, Ulid>,
}

impl CustomerBook {
    pub fn insert(&self, customer: Customer) {
        if let Some(email) = &customer.email {
            self.by_email.insert(email.clone(), customer.id);
        }
        if let Some(phone) = &customer.phone {
            self.by_phone.insert(phone.clone(), customer.id);
        }
        self.by_id.insert(customer.id, customer);
    }

    pub fn get(&self, id: &Ulid) -> Option<Customer> {
        self.by_id.get(id).map(|c| c.clone())
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn all(&self) -> Vec<Customer> {
        let mut out: Vec<Customer> = self.by_id.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|c| c.id);
        out
    }

    /// Email wins over phone. Both arguments must already be normalised.
    pub fn find(&self, email: Option<&str>, phone: Option<&str>) -> Option<Ulid> {
        if let Some(id) = email.and_then(|e| self.by_email.get(e)) {
            return Some(*id);
        }
        phone.and_then(|p| self.by_phone.get(p)).map(|id| *id)
    }

    /// Existing customer id, or a fresh record to be written with the booking.
    pub(crate) fn resolve(&self, details: &CustomerDetails) -> Result<(Ulid, Option<Customer>), EngineError> {
        validate_name(&details.name, "customer name")?;
        let email = details.email.as_deref().and_then(normalize_email);
        let phone = details.phone.as_deref().and_then(normalize_phone);
        for contact in [&email, &phone].into_iter().flatten() {
            if contact.len() > MAX_CONTACT_LEN {
                return Err(EngineError::LimitExceeded("customer contact too long"));
            }
        }

        if let Some(id) = self.find(email.as_deref(), phone.as_deref()) {
            return Ok((id, None));
        }
        let customer = Customer {
            id: Ulid::new(),
            name: details.name.trim().to_string(),
            email,
            phone,
        };
        Ok((customer.id, Some(customer)))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("  Ana@Example.COM ", Some("ana@example.com"))]
    #[case("   ", None)]
    fn emails_normalise(#[case] raw: &str, #[case] expected: Option<&str>) {
        assert_eq!(normalize_email(raw).as_deref(), expected);
    }

    #[rstest]
    #[case("+49 (170) 123-4567", Some("+491701234567"))]
    #[case("0170 1234567", Some("01701234567"))]
    #[case("n/a", None)]
    fn phones_normalise(#[case] raw: &str, #[case] expected: Option<&str>) {
        assert_eq!(normalize_phone(raw).as_deref(), expected);
    }

    fn details(name: &str, email: Option<&str>, phone: Option<&str>) -> CustomerDetails {
        CustomerDetails {
            name: name.into(),
            email: email.map(Into::into),
            phone: phone.map(Into::into),
        }
    }

    #[test]
    fn new_customer_is_created_with_normalised_contacts() {
        let book = CustomerBook::default();
        let (id, created) = book.resolve(&details(" Ana ", Some("ANA@x.io"), Some("+1 555 0100"))).unwrap();
        let created = created.unwrap();
        assert_eq!(created.id, id);
        assert_eq!(created.name, "Ana");
        assert_eq!(created.email.as_deref(), Some("ana@x.io"));
        assert_eq!(created.phone.as_deref(), Some("+15550100"));
    }

    #[test]
    fn existing_customer_matched_by_email_then_phone() {
        let book = CustomerBook::default();
        let (_, created) = book.resolve(&details("Ana", Some("ana@x.io"), Some("555-0100"))).unwrap();
        let ana = created.unwrap();
        book.insert(ana.clone());

        let (by_email, none) = book.resolve(&details("A. Silva", Some("Ana@X.io"), None)).unwrap();
        assert_eq!(by_email, ana.id);
        assert!(none.is_none());

        let (by_phone, none) = book.resolve(&details("Ana", None, Some("555 0100"))).unwrap();
        assert_eq!(by_phone, ana.id);
        assert!(none.is_none());

        let (other, created) = book.resolve(&details("Bo", Some("bo@x.io"), None)).unwrap();
        assert_ne!(other, ana.id);
        assert!(created.is_some());
    }

    #[test]
    fn name_is_required() {
        let book = CustomerBook::default();
        assert!(matches!(
            book.resolve(&details("  ", Some("a@b.c"), None)),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn customer_without_contacts_is_never_matched() {
        let book = CustomerBook::default();
        let (first, created) = book.resolve(&details("Walk-in", None, None)).unwrap();
        book.insert(created.unwrap());
        let (second, created) = book.resolve(&details("Walk-in", None, None)).unwrap();
        assert_ne!(first, second);
        assert!(created.is_some());
        assert_eq!(book.len(), 1);
    }
}
