pub mod kubeadm;
