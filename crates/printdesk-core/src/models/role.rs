//! Roles and the permission table.
//!
//! Every role maps to an explicit, fully populated `Permissions` record.
//! `Role::Unknown` is what any unrecognised wire value becomes, and it maps
//! to `Permissions::NONE`, so a role the client does not know about gets no
//! capabilities at all.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    Admin,
    Manager,
    Employee,
    Customer,
    Unknown,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Admin,
        Role::Manager,
        Role::Employee,
        Role::Customer,
        Role::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Employee => "employee",
            Role::Customer => "customer",
            Role::Unknown => "unknown",
        }
    }

    /// Parse a wire role. Matching is case-insensitive; "staff" is the
    /// older name for an employee.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "admin" => Role::Admin,
            "manager" => Role::Manager,
            "employee" | "staff" => Role::Employee,
            "customer" => Role::Customer,
            _ => Role::Unknown,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Role::Admin => "Administrator",
            Role::Manager => "Manager",
            Role::Employee => "Employee",
            Role::Customer => "Customer",
            Role::Unknown => "Unknown",
        }
    }

    pub fn permissions(self) -> &'static Permissions {
        match self {
            Role::Admin => &ADMIN,
            Role::Manager => &MANAGER,
            Role::Employee => &EMPLOYEE,
            Role::Customer => &CUSTOMER,
            Role::Unknown => &Permissions::NONE,
        }
    }
}

impl From<String> for Role {
    fn from(s: String) -> Self {
        Role::parse(&s)
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capabilities granted to a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Permissions {
    pub view_dashboard: bool,
    pub manage_orders: bool,
    pub view_all_orders: bool,
    pub manage_customers: bool,
    pub manage_staff: bool,
    pub manage_catalog: bool,
    pub view_reports: bool,
    pub place_orders: bool,
    pub upload_files: bool,
}

impl Permissions {
    pub const NONE: Permissions = Permissions {
        view_dashboard: false,
        manage_orders: false,
        view_all_orders: false,
        manage_customers: false,
        manage_staff: false,
        manage_catalog: false,
        view_reports: false,
        place_orders: false,
        upload_files: false,
    };
}

const ADMIN: Permissions = Permissions {
    view_dashboard: true,
    manage_orders: true,
    view_all_orders: true,
    manage_customers: true,
    manage_staff: true,
    manage_catalog: true,
    view_reports: true,
    place_orders: false,
    upload_files: true,
};

const MANAGER: Permissions = Permissions {
    view_dashboard: true,
    manage_orders: true,
    view_all_orders: true,
    manage_customers: true,
    manage_staff: false,
    manage_catalog: true,
    view_reports: true,
    place_orders: false,
    upload_files: true,
};

const EMPLOYEE: Permissions = Permissions {
    view_dashboard: true,
    manage_orders: true,
    view_all_orders: true,
    manage_customers: false,
    manage_staff: false,
    manage_catalog: false,
    view_reports: false,
    place_orders: false,
    upload_files: true,
};

const CUSTOMER: Permissions = Permissions {
    view_dashboard: true,
    manage_orders: false,
    view_all_orders: false,
    manage_customers: false,
    manage_staff: false,
    manage_catalog: false,
    view_reports: false,
    place_orders: true,
    upload_files: true,
};
