use clap::{Parser, ValueEnum};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "sentinela",
    version,
    about = "Distributed monitoring engine core"
)]
pub struct Args {
    /// Roles this process runs; pass one or both.
    #[arg(value_enum, required = true, num_args = 1..)]
    pub roles: Vec<Role>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
#[value(rename_all = "lowercase")]
pub enum Role {
    Controller,
    Executor,
}

impl Args {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_one_or_both_roles() {
        let args = Args::try_parse_from(["sentinela", "controller"]).unwrap();
        assert!(args.has_role(Role::Controller));
        assert!(!args.has_role(Role::Executor));

        let args = Args::try_parse_from(["sentinela", "controller", "executor"]).unwrap();
        assert!(args.has_role(Role::Controller));
        assert!(args.has_role(Role::Executor));
    }

    #[test]
    fn rejects_no_roles_and_unknown_roles() {
        assert!(Args::try_parse_from(["sentinela"]).is_err());
        assert!(Args::try_parse_from(["sentinela", "dashboard"]).is_err());
    }
}
