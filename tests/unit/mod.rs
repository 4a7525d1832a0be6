// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Unit tests for nsm-admission-webhook.
//!
//! These tests run without a Kubernetes cluster and exercise the public
//! API of individual components.

mod config_tests {
    use std::sync::Arc;

    use clap::Parser;
    use nsm_admission_webhook::config::ConfigError;
    use nsm_admission_webhook::tls::ServingCertificate;
    use nsm_admission_webhook::{Config, ConfigResolver, WebhookMode};

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("nsm-admission-webhook").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]);
        assert_eq!(config.annotation, "networkservicemesh.io");
        assert_eq!(config.nsurl_env_name, "NSM_NETWORK_SERVICES");
        assert_eq!(config.webhook_mode, WebhookMode::Spire);
        assert!(!config.uses_existing_certificates());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_list_flags_split_on_commas() {
        let config = parse(&[
            "--container-images",
            "ghcr.io/nsm/cmd-nsc:v1,ghcr.io/nsm/cmd-proxy:v1",
            "--labels",
            "spiffe.io/spiffe-id:true, team:mesh",
            "--envs",
            "LOG_LEVEL=TRACE,NSM_DIAL_TIMEOUT=5s",
        ]);
        assert_eq!(config.container_images.len(), 2);

        let labels = config.labels().unwrap();
        assert_eq!(labels["spiffe.io/spiffe-id"], "true");
        assert_eq!(labels["team"], "mesh");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_webhook_mode_parsing() {
        assert_eq!(
            parse(&["--webhook-mode", "selfregister"]).webhook_mode,
            WebhookMode::SelfRegister
        );
        assert_eq!(
            parse(&["--webhook-mode", "SPIRE"]).webhook_mode,
            WebhookMode::Spire
        );
        assert!(
            Config::try_parse_from(["nsm-admission-webhook", "--webhook-mode", "manual"]).is_err()
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = parse(&["--labels", "no-separator"]);
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLabel("no-separator".to_string()))
        );

        let config = parse(&["--envs", "=value"]);
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidEnv("=value".to_string()))
        );

        let config = parse(&["--sidecar-limits-cpu", "lots"]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidQuantity { .. })
        ));
    }

    #[test]
    fn test_resolver_self_signs_in_selfregister_mode() {
        let config = parse(&[
            "--webhook-mode",
            "selfregister",
            "--service-name",
            "admission-webhook-svc",
            "--namespace",
            "nsm-system",
        ]);
        let resolver = ConfigResolver::new(Arc::new(config));

        let certificate = resolver.certificate().unwrap();
        assert!(matches!(certificate, ServingCertificate::SelfSigned { .. }));
        let (cert_pem, _) = certificate.pem_pair().unwrap();
        assert_eq!(resolver.ca_bundle().unwrap(), Some(cert_pem));

        // Resolution happens once; later calls observe the same certificate
        let again = resolver.certificate().unwrap();
        assert_eq!(again.pem_pair().unwrap().0, cert_pem);
    }

    #[test]
    fn test_resolver_defers_to_svid_in_spire_mode() {
        let resolver = ConfigResolver::new(Arc::new(parse(&[])));
        assert!(matches!(
            resolver.certificate().unwrap(),
            ServingCertificate::External
        ));
        assert_eq!(resolver.ca_bundle().unwrap(), None);
    }
}

mod workload_tests {
    use nsm_admission_webhook::webhooks::WorkloadKind;

    #[test]
    fn test_kind_round_trip() {
        for kind in WorkloadKind::ALL {
            assert_eq!(WorkloadKind::from_kind(kind.as_str()), Some(kind));
            assert_eq!(kind.to_string(), kind.as_str());
        }
        assert_eq!(WorkloadKind::from_kind("pod"), None);
        assert_eq!(WorkloadKind::from_kind("CronJob"), None);
    }

    #[test]
    fn test_template_roots() {
        assert!(WorkloadKind::Pod.template_root().is_empty());
        for kind in WorkloadKind::ALL.into_iter().filter(|k| !k.is_pod()) {
            assert_eq!(kind.template_root(), ["spec", "template"]);
        }
    }
}

mod security_tests {
    use nsm_admission_webhook::webhooks::SecurityLevel;

    #[test]
    fn test_level_parsing_is_exact() {
        assert_eq!("restricted".parse::<SecurityLevel>(), Ok(SecurityLevel::Restricted));
        assert_eq!("baseline".parse::<SecurityLevel>(), Ok(SecurityLevel::Baseline));
        assert_eq!("privileged".parse::<SecurityLevel>(), Ok(SecurityLevel::Privileged));
        assert!("Restricted".parse::<SecurityLevel>().is_err());
        assert!(" restricted".parse::<SecurityLevel>().is_err());
    }

    #[test]
    fn test_unknown_namespace_is_privileged() {
        assert_eq!(SecurityLevel::classify(None), SecurityLevel::Privileged);
    }
}

mod mutation_tests {
    use nsm_admission_webhook::webhooks::mutation::{container_name, pool_resources};

    #[test]
    fn test_container_names() {
        assert_eq!(container_name("ghcr.io/networkservicemesh/cmd-nsc:v1.14.0"), "cmd-nsc");
        assert_eq!(container_name("cmd-nsc-init"), "cmd-nsc-init");
        assert_eq!(container_name("registry.local/nsm/nsc/"), "nsc");
    }

    #[test]
    fn test_pool_resources() {
        let pools = pool_resources(
            "kernel://vl3/nsm-1?sriovToken=intel.com/10G,kernel://vl3/nsm-2?sriovToken=intel.com/10G",
        )
        .unwrap();
        assert_eq!(pools.get("intel.com/10G"), Some(&2));

        assert_eq!(pool_resources("kernel://vl3/nsm-1").unwrap().len(), 0);
    }
}

mod decision_tests {
    use nsm_admission_webhook::webhooks::Decision;

    #[test]
    fn test_decision_labels() {
        assert_eq!(Decision::Skipped.to_string(), "skipped");
        assert_eq!(Decision::Unmodified.to_string(), "unmodified");
        assert_eq!(Decision::Patched.to_string(), "patched");
        assert_eq!(Decision::PatchFailed.to_string(), "patch_failed");
    }
}
