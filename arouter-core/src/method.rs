/// The four parts of a fully-qualified gRPC method name, split once at
/// router-construction/dispatch time and threaded through the forwarding
/// path so routers never need to re-parse the wire path string.
///
/// Equivalent to the original `methodDetails` / `newMethodDetails()`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Hash)]
pub struct MethodDetails {
    /// The full, unparsed method string, e.g. `/voltha.VolthaService/EnableDevice`.
    pub all: String,
    pub pkg: String,
    pub service: String,
    pub method: String,
}

impl MethodDetails {
    /// Parse a method name of the form `/<pkg>.<service>/<method>`.
    ///
    /// Malformed input never panics or errors: it yields a `MethodDetails`
    /// with `all` set to the original string and every other field empty,
    /// matching the original's lenient `newMethodDetails`. Callers that need
    /// to treat malformed method names as a hard error (the forwarder does,
    /// per spec scenario S6) check `is_well_formed()` themselves.
    pub fn parse(full: &str) -> Self {
        let all = full.to_string();

        let Some(rest) = full.strip_prefix('/') else {
            return MethodDetails { all, ..Default::default() };
        };

        let Some((pkg_service, method)) = rest.split_once('/') else {
            return MethodDetails { all, ..Default::default() };
        };

        let Some((pkg, service)) = pkg_service.rsplit_once('.') else {
            return MethodDetails { all, ..Default::default() };
        };

        if pkg.is_empty() || service.is_empty() || method.is_empty() {
            return MethodDetails { all, ..Default::default() };
        }

        MethodDetails {
            all,
            pkg: pkg.to_string(),
            service: service.to_string(),
            method: method.to_string(),
        }
    }

    /// `true` unless parsing fell back to the all-empty-parts case.
    pub fn is_well_formed(&self) -> bool {
        !self.pkg.is_empty() && !self.service.is_empty() && !self.method.is_empty()
    }

    /// The `package.Service` portion, used to look up a server's router table.
    pub fn package_service(&self) -> String {
        format!("{}.{}", self.pkg, self.service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_method() {
        let md = MethodDetails::parse("/voltha.VolthaService/EnableDevice");
        assert_eq!(
            md,
            MethodDetails {
                all: "/voltha.VolthaService/EnableDevice".into(),
                pkg: "voltha".into(),
                service: "VolthaService".into(),
                method: "EnableDevice".into(),
            }
        );
        assert!(md.is_well_formed());
    }

    #[test]
    fn parses_nested_package() {
        let md = MethodDetails::parse("/voltha.common.VolthaService/ListDevicePorts");
        assert_eq!(md.pkg, "voltha.common");
        assert_eq!(md.service, "VolthaService");
        assert_eq!(md.method, "ListDevicePorts");
    }

    #[test]
    fn malformed_method_yields_empty_parts() {
        let md = MethodDetails::parse("garbage");
        assert_eq!(md.all, "garbage");
        assert_eq!(md.pkg, "");
        assert_eq!(md.service, "");
        assert_eq!(md.method, "");
        assert!(!md.is_well_formed());
    }

    #[test]
    fn missing_method_segment_is_malformed() {
        let md = MethodDetails::parse("/voltha.VolthaService");
        assert!(!md.is_well_formed());
    }

    #[test]
    fn package_service_joins_parts() {
        let md = MethodDetails::parse("/voltha.VolthaService/EnableDevice");
        assert_eq!(md.package_service(), "voltha.VolthaService");
    }
}
