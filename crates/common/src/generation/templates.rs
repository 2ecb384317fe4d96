//! Document template registry
//!
//! Roles map to their templates through this explicit table; unknown
//! roles and templates are rejected at the boundary instead of being
//! dispatched dynamically. Prompts declare their variables as `{name}`
//! placeholders and every declared variable must be supplied before any
//! external call is made.

use std::collections::HashMap;

use crate::db::models::Role;
use crate::errors::{AppError, Result};

/// A generation template tied to a single requester role
#[derive(Debug, Clone, Copy)]
pub struct DocumentTemplate {
    pub id: &'static str,
    pub role: Role,
    pub title: &'static str,
    pub required_inputs: &'static [&'static str],
    prompt: &'static str,
}

const JSON_TAIL: &str =
    "Return ONLY valid JSON without any additional text or markdown formatting.";

static TEMPLATES: &[DocumentTemplate] = &[
    DocumentTemplate {
        id: "patient_consent",
        role: Role::Patient,
        title: "Patient Consent",
        required_inputs: &["name"],
        prompt: "Generate a patient consent document for {name}.\n\
                 Structure the document as a JSON object with these sections:\n\
                 - patient_information (object with name and id)\n\
                 - consent_scope (array of strings)\n\
                 - acknowledgements (array of strings)\n\n",
    },
    DocumentTemplate {
        id: "medical_record",
        role: Role::Provider,
        title: "Medical Record",
        required_inputs: &["name", "condition"],
        prompt: "Generate a medical record for {name} presenting with {condition}.\n\
                 Structure the document as a JSON object with these sections:\n\
                 - patient_information (object with name and id)\n\
                 - medical_history (array of entries)\n\
                 - current_condition (string)\n\
                 - recommendations (array of strings)\n\n",
    },
    DocumentTemplate {
        id: "insurance_approval",
        role: Role::Insurer,
        title: "Insurance Approval",
        required_inputs: &["name", "provider", "procedures"],
        prompt: "Generate insurance approval documentation for {name} with provider \
                 {provider} covering: {procedures}.\n\
                 Structure the document as a JSON object with these sections:\n\
                 - patient_information (object with name and id)\n\
                 - insurance_approval (object with provider, approved_procedures, effective_date)\n\
                 - costs (array of entries)\n\n",
    },
    DocumentTemplate {
        id: "prescription",
        role: Role::Pharmacy,
        title: "Prescription",
        required_inputs: &["name", "medication", "dosage"],
        prompt: "Generate a prescription document for {name}: {medication} at {dosage}.\n\
                 Structure the document as a JSON object with these sections:\n\
                 - patient_information (object with name and id)\n\
                 - medication (string)\n\
                 - dosage (string)\n\
                 - instructions (array of strings)\n\n",
    },
    DocumentTemplate {
        id: "administrative_summary",
        role: Role::Administrator,
        title: "Administrative Summary",
        required_inputs: &["name"],
        prompt: "Generate an administrative case summary for {name}.\n\
                 Structure the document as a JSON object with these sections:\n\
                 - patient_information (object with name and id)\n\
                 - items (array of entries)\n\
                 - costs (array of entries)\n\n",
    },
];

/// Look up a template by id
pub fn get(template_id: &str) -> Result<&'static DocumentTemplate> {
    TEMPLATES
        .iter()
        .find(|t| t.id == template_id)
        .ok_or_else(|| AppError::TemplateNotFound {
            id: template_id.to_string(),
        })
}

/// Templates available to a role
pub fn for_role(role: Role) -> Vec<&'static DocumentTemplate> {
    TEMPLATES.iter().filter(|t| t.role == role).collect()
}

impl DocumentTemplate {
    /// Render the prompt, failing before any external call when the
    /// template belongs to another role or a declared variable is
    /// missing.
    pub fn build_prompt(&self, role: Role, inputs: &HashMap<String, String>) -> Result<String> {
        if self.role != role {
            return Err(AppError::Validation {
                message: format!(
                    "template {} belongs to role {}, not {}",
                    self.id, self.role, role
                ),
                field: Some("template_id".into()),
            });
        }

        let missing: Vec<String> = self
            .required_inputs
            .iter()
            .filter(|k| !inputs.contains_key(**k))
            .map(|k| k.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(AppError::TemplateInput {
                template_id: self.id.to_string(),
                missing,
            });
        }

        let mut prompt = self.prompt.to_string();
        for (key, value) in inputs {
            prompt = prompt.replace(&format!("{{{}}}", key), value);
        }
        prompt.push_str(JSON_TAIL);
        Ok(prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_every_role_has_a_template() {
        for role in Role::ALL {
            assert!(!for_role(role).is_empty(), "no template for {role}");
        }
    }

    #[test]
    fn test_unknown_template_rejected() {
        assert!(matches!(
            get("nonexistent"),
            Err(AppError::TemplateNotFound { .. })
        ));
    }

    #[test]
    fn test_build_prompt_substitutes_variables() {
        let template = get("patient_consent").unwrap();
        let prompt = template
            .build_prompt(Role::Patient, &inputs(&[("name", "Jane Doe")]))
            .unwrap();
        assert!(prompt.contains("Jane Doe"));
        assert!(!prompt.contains("{name}"));
    }

    #[test]
    fn test_missing_inputs_fail_fast() {
        let template = get("insurance_approval").unwrap();
        let err = template
            .build_prompt(Role::Insurer, &inputs(&[("name", "Jane Doe")]))
            .unwrap_err();
        match err {
            AppError::TemplateInput { missing, .. } => {
                assert!(missing.contains(&"provider".to_string()));
                assert!(missing.contains(&"procedures".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_role_mismatch_rejected() {
        let template = get("prescription").unwrap();
        let err = template
            .build_prompt(Role::Patient, &inputs(&[("name", "Jane Doe")]))
            .unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
    }
}
