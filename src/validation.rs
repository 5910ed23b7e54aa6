//! Form Validation
//!
//! Field rules for the sign-in, registration and new-listing forms. Error
//! messages are the ones shown next to each field in the UI.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::listing::ListingFields;

/// Minimum password length accepted at registration
pub const MIN_PASSWORD_LEN: usize = 6;

fn phone_pattern() -> &'static Regex {
    static PHONE: OnceLock<Regex> = OnceLock::new();
    PHONE.get_or_init(|| Regex::new(r"^\d{11,12}$").expect("valid phone pattern"))
}

fn email_pattern() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid email pattern"))
}

/// Every input field the forms validate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Field {
    Name,
    Model,
    Year,
    Km,
    Price,
    City,
    Description,
    Whatsapp,
    Email,
    Password,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Name => "name",
            Field::Model => "model",
            Field::Year => "year",
            Field::Km => "km",
            Field::Price => "price",
            Field::City => "city",
            Field::Description => "description",
            Field::Whatsapp => "whatsapp",
            Field::Email => "email",
            Field::Password => "password",
        }
    }
}

/// Per-field error messages; the first failing rule of a field wins
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldErrors(BTreeMap<Field, String>);

impl FieldErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: Field, message: impl Into<String>) {
        self.0.entry(field).or_insert_with(|| message.into());
    }

    pub fn get(&self, field: Field) -> Option<&str> {
        self.0.get(&field).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Field, &str)> {
        self.0.iter().map(|(f, m)| (*f, m.as_str()))
    }

    fn into_result<T>(self, value: T) -> Result<T, FieldErrors> {
        if self.is_empty() {
            Ok(value)
        } else {
            Err(self)
        }
    }
}

/// Rejected form submission: failing fields and/or no photo attached
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationError {
    pub fields: FieldErrors,
    pub missing_images: bool,
}

impl ValidationError {
    pub fn no_images() -> Self {
        Self {
            fields: FieldErrors::new(),
            missing_images: true,
        }
    }

    pub fn field_error(&self, field: Field) -> Option<&str> {
        self.fields.get(field)
    }
}

impl From<FieldErrors> for ValidationError {
    fn from(fields: FieldErrors) -> Self {
        Self {
            fields,
            missing_images: false,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.missing_images {
            parts.push("no images".to_string());
        }
        if !self.fields.is_empty() {
            let names: Vec<_> = self.fields.iter().map(|(field, _)| field.as_str()).collect();
            parts.push(format!("invalid fields: {}", names.join(", ")));
        }
        if parts.is_empty() {
            parts.push("invalid input".to_string());
        }
        write!(f, "Validation failed: {}", parts.join("; "))
    }
}

impl std::error::Error for ValidationError {}

/// User-facing message shown when a listing has no photo
pub const NO_IMAGES_MESSAGE: &str = "Insira pelo menos uma imagem para prosseguir!";

fn require(errors: &mut FieldErrors, field: Field, value: &str, message: &str) -> bool {
    if value.trim().is_empty() {
        errors.add(field, message);
        false
    } else {
        true
    }
}

fn check_email(errors: &mut FieldErrors, email: &str) {
    if require(errors, Field::Email, email, "O campo e-mail é obrigatório")
        && !email_pattern().is_match(email.trim())
    {
        errors.add(Field::Email, "Insira um e-mail válido!");
    }
}

/// Raw input of the new-listing form
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListingDraft {
    pub name: String,
    pub model: String,
    pub year: String,
    pub km: String,
    pub price: String,
    pub city: String,
    pub description: String,
    pub whatsapp: String,
}

impl ListingDraft {
    /// Check every field and return the trimmed values
    pub fn validate(&self) -> Result<ListingFields, FieldErrors> {
        let mut errors = FieldErrors::new();

        require(&mut errors, Field::Name, &self.name, "O nome é obrigatório");
        require(&mut errors, Field::Model, &self.model, "O modelo é obrigatório");
        require(&mut errors, Field::Year, &self.year, "O ano do veículo é obrigatório");
        require(&mut errors, Field::Km, &self.km, "O KM do veículo é obrigatório");
        require(&mut errors, Field::Price, &self.price, "O preço é obrigatório");
        require(&mut errors, Field::City, &self.city, "A cidade é obrigatória");
        require(
            &mut errors,
            Field::Description,
            &self.description,
            "A descrição é obrigatória",
        );
        if require(&mut errors, Field::Whatsapp, &self.whatsapp, "O telefone é obrigatório")
            && !phone_pattern().is_match(self.whatsapp.trim())
        {
            errors.add(Field::Whatsapp, "Número de telefone inválido!");
        }

        errors.into_result(ListingFields {
            name: self.name.trim().to_string(),
            model: self.model.trim().to_string(),
            year: self.year.trim().to_string(),
            km: self.km.trim().to_string(),
            price: self.price.trim().to_string(),
            city: self.city.trim().to_string(),
            description: self.description.trim().to_string(),
            whatsapp: self.whatsapp.trim().to_string(),
        })
    }
}

/// Sign-in form input
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SignInForm {
    pub email: String,
    pub password: String,
}

impl SignInForm {
    pub fn validate(&self) -> Result<(), FieldErrors> {
        let mut errors = FieldErrors::new();
        check_email(&mut errors, &self.email);
        require(&mut errors, Field::Password, &self.password, "O campo senha é obrigatório!");
        errors.into_result(())
    }
}

/// Registration form input
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegisterForm {
    pub name: String,
    pub email: String,
    pub password: String,
}

impl RegisterForm {
    pub fn validate(&self) -> Result<(), FieldErrors> {
        let mut errors = FieldErrors::new();
        require(&mut errors, Field::Name, &self.name, "O campo nome é obrigatório!");
        check_email(&mut errors, &self.email);
        if require(&mut errors, Field::Password, &self.password, "O campo senha é obrigatório!")
            && self.password.chars().count() < MIN_PASSWORD_LEN
        {
            errors.add(Field::Password, "A senha deve conter pelo menos 6 caracteres");
        }
        errors.into_result(())
    }
}
