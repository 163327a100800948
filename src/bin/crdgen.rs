use kube::CustomResourceExt;
use rosterd_kubernetes::crd;

fn main() {
    print!(
        "{}",
        serde_yaml::to_string(&crd::ip_pool::IPPool::crd()).unwrap()
    );
    println!("---");
    print!(
        "{}",
        serde_yaml::to_string(&crd::overlapping_range::OverlappingRangeIPReservation::crd())
            .unwrap()
    );
}
