//! End-to-end manifest generation against fixture files on disk.

use meshtest::manifest::{core_install_file, ManifestGenerator};
use meshtest::TestConfig;

const CORE_FIXTURE: &str = r#"apiVersion: v1
kind: Namespace
metadata:
  name: istio-system
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: istio
  namespace: istio-system
data:
  mesh: |-
    mtlsExcludedServices: ["svcA"]
    connectTimeout: 10s
    drainDuration: 45s
    parentShutdownDuration: 1m0s
    discoveryRefreshDelay: 30s
---
apiVersion: v1
kind: Service
metadata:
  name: istio-ingress
  namespace: istio-system
spec:
  type: LoadBalancer
---
apiVersion: extensions/v1beta1
kind: Deployment
metadata:
  name: istio-pilot
  namespace: istio-system
spec:
  template:
    spec:
      containers:
      - name: discovery
        image: docker.io/pilot:0.2.0
        imagePullPolicy: IfNotPresent
        args:
        - --configStoreURL=k8s://
      - name: istio-proxy
        image: docker.io/proxy:0.2.0
        imagePullPolicy: IfNotPresent
        args:
        - '30s' #discoveryRefreshDelay
        - '10s' #connectTimeout
        - '45s' #drainDuration
        - '1m0s' #parentShutdownDuration
      initContainers:
      - name: init
        image: docker.io/proxy_init:0.2.0
"#;

const INJECTOR_FIXTURE: &str = r#"apiVersion: v1
kind: ConfigMap
metadata:
  name: istio-inject
  namespace: istio-system
data:
  config: |-
    version: 0.2.0
    initImage: docker.io/proxy_init:0.2.0
    proxyImage: docker.io/proxy:0.2.0
---
apiVersion: extensions/v1beta1
kind: Deployment
metadata:
  name: istio-sidecar-injector
  namespace: istio-system
spec:
  template:
    spec:
      containers:
      - name: injector
        image: docker.io/sidecar_injector:0.2.0
"#;

#[tokio::test]
async fn full_core_pipeline_produces_namespaced_auth_manifest() {
    let config = TestConfig::new("t1")
        .auth_enabled(true)
        .mtls_excluded_service("svcB")
        .local_cluster(true)
        .proxy_image("gcr.io/testing", "abc123")
        .pilot_image("gcr.io/testing", "abc123")
        .image_pull_policy("Always");

    let dir = tempfile::tempdir().expect("Should create temp dir");
    let src = dir.path().join(core_install_file(false, true));
    let dst = dir.path().join("generated.yaml");
    std::fs::write(&src, CORE_FIXTURE).expect("Should write fixture");

    ManifestGenerator::new(&config)
        .generate_core(&src, &dst)
        .await
        .expect("Should generate core manifest");
    let out = std::fs::read_to_string(&dst).expect("Should read generated manifest");

    // Namespace isolation: every occurrence rewritten, config store scoped.
    assert!(!out.contains("istio-system"));
    assert_eq!(out.matches("namespace: t1").count(), 3);
    assert!(out.contains("name: t1"));
    assert!(out.contains("--configStoreURL=k8s://?ns=t1"));

    // mTLS exclusions extend the rendered list.
    assert!(out.contains("mtlsExcludedServices: [\"svcA\",\"svcB\"]"));

    // Timings compressed, both plain and annotated forms.
    assert!(out.contains("connectTimeout: 1s"));
    assert!(out.contains("drainDuration: 2s"));
    assert!(out.contains("parentShutdownDuration: 3s"));
    assert!(out.contains("discoveryRefreshDelay: 1s"));
    assert!(out.contains("'1s' #connectTimeout"));
    assert!(out.contains("'2s' #drainDuration"));
    assert!(out.contains("'3s' #parentShutdownDuration"));
    assert!(out.contains("'1s' #discoveryRefreshDelay"));

    // Image rewrites respect the module-name anchor.
    assert!(out.contains("image: gcr.io/testing/pilot:abc123"));
    assert!(out.contains("image: gcr.io/testing/proxy:abc123"));
    assert!(out.contains("image: docker.io/proxy_init:0.2.0"));
    assert_eq!(out.matches("imagePullPolicy: Always").count(), 2);

    // Local cluster swaps the ingress service type.
    assert!(out.contains("type: NodePort"));
    assert!(!out.contains("LoadBalancer"));
}

#[tokio::test]
async fn full_injector_pipeline_rewrites_template() {
    let config = TestConfig::new("t1")
        .pilot_image("gcr.io/testing", "abc123")
        .proxy_image("gcr.io/testing", "abc123");

    let dir = tempfile::tempdir().expect("Should create temp dir");
    let src = dir.path().join("istio-sidecar-injector.yaml");
    let dst = dir.path().join("generated-injector.yaml");
    std::fs::write(&src, INJECTOR_FIXTURE).expect("Should write fixture");

    ManifestGenerator::new(&config)
        .generate_injector(&src, &dst)
        .await
        .expect("Should generate injector manifest");
    let out = std::fs::read_to_string(&dst).expect("Should read generated manifest");

    assert!(!out.contains("istio-system"));
    assert!(out.contains("image: gcr.io/testing/sidecar_injector:abc123"));
    assert!(out.contains("version: abc123"));
    assert!(out.contains("initImage: gcr.io/testing/proxy_init:abc123"));
    assert!(out.contains("proxyImage: gcr.io/testing/proxy:abc123"));
}

#[tokio::test]
async fn cluster_wide_pipeline_preserves_system_namespace() {
    let config = TestConfig::cluster_wide().auth_enabled(true);

    let dir = tempfile::tempdir().expect("Should create temp dir");
    let src = dir.path().join(core_install_file(true, true));
    let dst = dir.path().join("generated.yaml");
    std::fs::write(&src, CORE_FIXTURE).expect("Should write fixture");

    ManifestGenerator::new(&config)
        .generate_core(&src, &dst)
        .await
        .expect("Should generate core manifest");
    let out = std::fs::read_to_string(&dst).expect("Should read generated manifest");

    assert!(out.contains("namespace: istio-system"));
    assert!(out.contains("--configStoreURL=k8s://\n") || out.contains("- --configStoreURL=k8s://"));
    assert!(!out.contains("k8s://?ns="));
}
