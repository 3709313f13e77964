use crate::model::{Affiliation, Role, RoomCategory};

/// Normalize a role label. Accepts the canonical English labels plus the
/// legacy Spanish labels still present in imported records.
pub fn parse_role_label(label: &str) -> Option<Role> {
    match label.trim().to_lowercase().as_str() {
        "faculty" | "docente" => Some(Role::Faculty),
        "graduate" | "posgrado" | "postgrado" => Some(Role::Graduate),
        "undergraduate" | "alumno" | "estudiante" | "grado" => Some(Role::Undergraduate),
        _ => None,
    }
}

/// Normalize a room category label. Same legacy-label policy as roles.
pub fn parse_category_label(label: &str) -> Option<RoomCategory> {
    match label.trim().to_lowercase().as_str() {
        "open" | "libre" => Some(RoomCategory::Open),
        "graduate" | "posgrado" | "postgrado" => Some(RoomCategory::Graduate),
        "faculty" | "docente" => Some(RoomCategory::Faculty),
        _ => None,
    }
}

/// A participant's effective role is the highest-privilege role across all
/// of their program affiliations: faculty over graduate over undergraduate.
/// `None` means no affiliations at all, which fails admission.
pub fn effective_role(affiliations: &[Affiliation]) -> Option<Role> {
    affiliations.iter().map(|a| a.role).max()
}
